//! State commands: inspect and edit the seen-state store.

use std::path::{Path, PathBuf};

use crate::config::Settings;

use super::open_seen_state;

/// Keys are absolute paths; relative arguments resolve against the cwd.
fn absolute(path: &Path) -> anyhow::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

pub fn run_get(settings: &Settings, path: &Path) -> anyhow::Result<()> {
    let seen = open_seen_state(settings)?;
    let path = absolute(path)?;

    match seen.get(&path)? {
        Some(entry) => {
            println!("path       {}", path.display());
            println!("modified   {}", entry.modified.to_rfc3339());
            println!("checksum   {}", entry.checksum.as_deref().unwrap_or("-"));
            println!("marked at  {}", entry.marked_at.to_rfc3339());
        }
        None => println!("{} has not been shipped", path.display()),
    }
    Ok(())
}

pub fn run_forget(settings: &Settings, path: &Path) -> anyhow::Result<()> {
    let seen = open_seen_state(settings)?;
    let path = absolute(path)?;

    if seen.forget(&path)? {
        seen.flush()?;
        println!("Forgot {}; it ships again on the next poll", path.display());
    } else {
        println!("{} was not tracked", path.display());
    }
    Ok(())
}

pub fn run_count(settings: &Settings) -> anyhow::Result<()> {
    let seen = open_seen_state(settings)?;
    println!("{}", seen.len());
    Ok(())
}
