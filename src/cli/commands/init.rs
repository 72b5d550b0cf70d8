//! Init command: write a starter configuration.

use std::path::Path;

use crate::config::Settings;

pub fn run_init(config: Option<&Path>, force: bool) -> anyhow::Result<()> {
    let path = Settings::config_path(config);
    let written = Settings::init_config_file(&path, force)?;

    println!("Created configuration file at: {}", written.display());
    println!("Add a [biz.<NAME>] section for each directory to watch, then run:");
    println!("  bizwatch check");
    Ok(())
}
