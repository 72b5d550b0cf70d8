//! File metadata resolved at dispatch time.
//!
//! A [`FileRecord`] is built from the filesystem when a task is executed,
//! not when the event was observed, so queuing delay never leaves handlers
//! looking at stale sizes or timestamps.

use std::fs::Metadata;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use sha2::{Digest, Sha256};

use super::event::ChangeEvent;
use super::rule::slash_path;

/// Everything a sink needs to ship one file.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub absolute_path: PathBuf,
    /// Parent directory relative to the rule root, `/`-separated, no edge separators.
    pub relative_sub_directory: String,
    pub file_name: String,
    /// Lowercase, including the leading dot; empty when the file has none.
    pub extension: String,
    pub size_bytes: u64,
    pub create_time: DateTime<Local>,
    pub modify_time: DateTime<Local>,
    pub folder_create_time: DateTime<Local>,
    pub content_bytes: Vec<u8>,
    /// SHA-256 of `content_bytes`, lowercase hex.
    pub checksum: String,
    pub host_id: String,
    pub originating_event: ChangeEvent,
}

/// Outcome of resolving an event against the filesystem.
#[derive(Debug)]
pub enum Resolved {
    File(Box<FileRecord>),
    /// The path is a directory; nothing to ship.
    Directory,
}

impl FileRecord {
    /// Stat and read the event's path.
    ///
    /// An `Err` means the file vanished or became unreadable between the
    /// event and now.
    pub async fn resolve(event: &ChangeEvent, host_id: &str) -> std::io::Result<Resolved> {
        let path = event.path.as_path();
        let meta = tokio::fs::symlink_metadata(path).await?;
        if meta.is_dir() {
            return Ok(Resolved::Directory);
        }

        let parent = path.parent().unwrap_or(Path::new(""));
        let folder_meta = tokio::fs::symlink_metadata(parent).await?;
        let content_bytes = tokio::fs::read(path).await?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let extension = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
            .unwrap_or_default();

        let modify_time = meta
            .modified()
            .map(DateTime::<Local>::from)
            .unwrap_or_else(|_| Local::now());

        Ok(Resolved::File(Box::new(FileRecord {
            absolute_path: path.to_path_buf(),
            relative_sub_directory: relative_sub_directory(&event.root_path, parent),
            file_name,
            extension,
            size_bytes: meta.len(),
            create_time: created_time(&meta).unwrap_or(modify_time),
            modify_time,
            folder_create_time: created_time(&folder_meta).unwrap_or(modify_time),
            checksum: checksum(&content_bytes),
            content_bytes,
            host_id: host_id.to_string(),
            originating_event: event.clone(),
        })))
    }

    pub fn business_id(&self) -> &str {
        &self.originating_event.business_id
    }
}

/// `parent` relative to `root`, rendered with `/` and trimmed of separators.
pub fn relative_sub_directory(root: &Path, parent: &Path) -> String {
    let rel = parent.strip_prefix(root).unwrap_or(parent);
    slash_path(rel).trim_matches('/').to_string()
}

/// SHA-256 hex digest.
pub fn checksum(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Inode change time on Unix, birth time elsewhere.
#[cfg(unix)]
fn created_time(meta: &Metadata) -> Option<DateTime<Local>> {
    use chrono::TimeZone;
    use std::os::unix::fs::MetadataExt;

    Local
        .timestamp_opt(meta.ctime(), meta.ctime_nsec() as u32)
        .single()
}

#[cfg(not(unix))]
fn created_time(meta: &Metadata) -> Option<DateTime<Local>> {
    meta.created().ok().map(DateTime::<Local>::from)
}
