//! Local mirror sink.
//!
//! Writes each file to `<destination>/<relative_sub_directory>/<file_name>`,
//! creating directories as needed.
//!
//! A copy that is about to be replaced is moved to
//! `<destination>/.bizwatch-prev/...` first, so a rollback can put it back.
//! The new content is written next to the target and renamed over it, so
//! the mirror never holds a half-written file.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::watchdog::error::HandlerError;
use crate::watchdog::handler::Handler;
use crate::watchdog::record::FileRecord;

/// Directory under the destination holding the copies a rollback restores.
pub const PREVIOUS_DIR: &str = ".bizwatch-prev";

pub struct LocalBackupHandler {
    destination: PathBuf,
    priority: i32,
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> HandlerError + '_ {
    move |source| HandlerError::Io {
        path: path.to_path_buf(),
        source,
    }
}

async fn ensure_parent(path: &Path) -> Result<(), HandlerError> {
    match path.parent() {
        Some(parent) => tokio::fs::create_dir_all(parent).await.map_err(io_err(parent)),
        None => Ok(()),
    }
}

/// `remove_file` that treats a missing file as done.
async fn remove_if_present(path: &Path) -> Result<(), HandlerError> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(io_err(path)(e)),
        _ => Ok(()),
    }
}

impl LocalBackupHandler {
    pub fn new(destination: impl Into<PathBuf>, priority: i32) -> Self {
        Self {
            destination: destination.into(),
            priority,
        }
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    fn relative_for(record: &FileRecord) -> PathBuf {
        let mut rel = PathBuf::new();
        for segment in record
            .relative_sub_directory
            .split('/')
            .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        {
            rel.push(segment);
        }
        rel.push(&record.file_name);
        rel
    }

    /// Where `record` ends up in the mirror.
    pub fn target_for(&self, record: &FileRecord) -> PathBuf {
        self.destination.join(Self::relative_for(record))
    }

    /// Where the copy replaced by `record` is kept until the next ship.
    pub fn previous_for(&self, record: &FileRecord) -> PathBuf {
        self.destination
            .join(PREVIOUS_DIR)
            .join(Self::relative_for(record))
    }
}

#[async_trait]
impl Handler for LocalBackupHandler {
    fn name(&self) -> &str {
        "backup"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn handle(&self, record: &FileRecord) -> Result<(), HandlerError> {
        let target = self.target_for(record);
        let previous = self.previous_for(record);
        ensure_parent(&target).await?;

        // a previous copy left by an earlier ship belongs to that ship
        remove_if_present(&previous).await?;
        if tokio::fs::try_exists(&target).await.map_err(io_err(&target))? {
            ensure_parent(&previous).await?;
            tokio::fs::rename(&target, &previous)
                .await
                .map_err(io_err(&target))?;
        }

        let mut partial = target.clone().into_os_string();
        partial.push(".bizwatch-tmp");
        let partial = PathBuf::from(partial);
        tokio::fs::write(&partial, &record.content_bytes)
            .await
            .map_err(io_err(&partial))?;
        tokio::fs::rename(&partial, &target)
            .await
            .map_err(io_err(&target))?;

        crate::debug_event!("backup", "copied", "{}", target.display());
        Ok(())
    }

    /// Put back the copy this ship replaced, or remove the new copy if
    /// there was none.
    async fn rollback(&self, record: &FileRecord) -> Result<(), HandlerError> {
        let target = self.target_for(record);
        let previous = self.previous_for(record);

        match tokio::fs::rename(&previous, &target).await {
            Ok(()) => {
                crate::debug_event!("backup", "restored", "{}", target.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                remove_if_present(&target).await?;
                crate::debug_event!("backup", "rolled back", "{}", target.display());
                Ok(())
            }
            Err(e) => Err(io_err(&previous)(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watchdog::event::{ChangeEvent, Operation};
    use crate::watchdog::record::Resolved;
    use std::fs;
    use tempfile::TempDir;

    async fn record_for(root: &Path, rel: &str) -> FileRecord {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "payload").unwrap();
        let event = ChangeEvent::new(&path, Operation::Create, "T1", root);
        match FileRecord::resolve(&event, "station-7").await.unwrap() {
            Resolved::File(record) => *record,
            Resolved::Directory => panic!("expected a file"),
        }
    }

    #[tokio::test]
    async fn test_backup_mirrors_relative_layout() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let record = record_for(src.path(), "LOUP/1395T/run.csv").await;

        let handler = LocalBackupHandler::new(dst.path(), 10);
        handler.handle(&record).await.unwrap();

        let copied = dst.path().join("LOUP/1395T/run.csv");
        assert_eq!(fs::read_to_string(&copied).unwrap(), "payload");

        handler.rollback(&record).await.unwrap();
        assert!(!copied.exists());
        // second rollback is a no-op
        handler.rollback(&record).await.unwrap();
    }

    #[tokio::test]
    async fn test_rollback_restores_previously_mirrored_version() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let handler = LocalBackupHandler::new(dst.path(), 10);
        let copied = dst.path().join("LOUP/run.csv");

        let v1 = record_for(src.path(), "LOUP/run.csv").await;
        handler.handle(&v1).await.unwrap();

        fs::write(src.path().join("LOUP/run.csv"), "payload-v2").unwrap();
        let event = v1.originating_event.clone();
        let v2 = match FileRecord::resolve(&event, "station-7").await.unwrap() {
            Resolved::File(record) => *record,
            Resolved::Directory => panic!("expected a file"),
        };
        handler.handle(&v2).await.unwrap();
        assert_eq!(fs::read_to_string(&copied).unwrap(), "payload-v2");

        // a later sink failed for v2: the mirror goes back to v1
        handler.rollback(&v2).await.unwrap();
        assert_eq!(fs::read_to_string(&copied).unwrap(), "payload");
        assert!(!handler.previous_for(&v2).exists());
    }

    #[tokio::test]
    async fn test_stale_previous_copy_is_not_restored() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let handler = LocalBackupHandler::new(dst.path(), 10);
        let record = record_for(src.path(), "run.csv").await;

        handler.handle(&record).await.unwrap();
        handler.handle(&record).await.unwrap();
        assert!(handler.previous_for(&record).exists());

        // mirror cleared by an operator, then a fresh ship fails
        fs::remove_file(handler.target_for(&record)).unwrap();
        handler.handle(&record).await.unwrap();
        handler.rollback(&record).await.unwrap();
        assert!(!handler.target_for(&record).exists());
    }
}
