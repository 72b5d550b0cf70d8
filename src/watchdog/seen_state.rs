//! Persisted "already seen" state.
//!
//! Maps absolute file paths to the modification time (and checksum) of the
//! last version that went through the whole handler chain. Both the poller
//! and the dispatcher consult it; only the dispatcher writes it, and only
//! after a fully successful chain.

use std::path::Path;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

use super::error::StateError;

/// Value stored per path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenEntry {
    pub modified: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub marked_at: DateTime<Utc>,
}

/// Embedded key-value store backed by sled.
///
/// Cloning is cheap; clones share the same database handle.
#[derive(Clone)]
pub struct SeenState {
    db: sled::Db,
}

impl SeenState {
    /// Open or create the store under `dir`.
    pub fn open(dir: &Path) -> Result<Self, StateError> {
        let db = sled::open(dir.join("seen.db")).map_err(|source| StateError::Open {
            path: dir.to_path_buf(),
            source,
        })?;
        Ok(Self { db })
    }

    /// Throwaway store for tests and dry runs.
    pub fn temporary() -> Result<Self, StateError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    pub fn get(&self, path: &Path) -> Result<Option<SeenEntry>, StateError> {
        let key = key_for(path);
        match self.db.get(key.as_bytes())? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StateError::Corrupt {
                    key,
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    /// Whether `path` was last shipped with exactly this modification time.
    pub fn is_unchanged(&self, path: &Path, modified: DateTime<Local>) -> Result<bool, StateError> {
        Ok(self
            .get(path)?
            .is_some_and(|entry| entry.modified == modified))
    }

    /// Record a successful dispatch.
    pub fn mark(
        &self,
        path: &Path,
        modified: DateTime<Local>,
        checksum: Option<&str>,
    ) -> Result<(), StateError> {
        let entry = SeenEntry {
            modified: modified.with_timezone(&Utc),
            checksum: checksum.map(str::to_string),
            marked_at: Utc::now(),
        };
        let key = key_for(path);
        let value = serde_json::to_vec(&entry).map_err(|e| StateError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.db.insert(key.as_bytes(), value)?;
        Ok(())
    }

    /// Drop the entry for `path`; returns whether one existed.
    pub fn forget(&self, path: &Path) -> Result<bool, StateError> {
        Ok(self.db.remove(key_for(path).as_bytes())?.is_some())
    }

    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }

    pub fn flush(&self) -> Result<(), StateError> {
        self.db.flush()?;
        Ok(())
    }
}

fn key_for(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
