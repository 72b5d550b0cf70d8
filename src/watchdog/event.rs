//! Change events flowing from the watchers to the dispatcher.

use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

/// Filesystem operation observed for a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Write,
    Remove,
    Rename,
    /// Synthetic: emitted by the poller for files not yet in seen-state.
    Load,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "CREATE",
            Operation::Write => "WRITE",
            Operation::Remove => "REMOVE",
            Operation::Rename => "RENAME",
            Operation::Load => "LOAD",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single in-memory change notification. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub operation: Operation,
    pub business_id: String,
    pub root_path: PathBuf,
    pub observed_at: Instant,
}

impl ChangeEvent {
    pub fn new(
        path: impl Into<PathBuf>,
        operation: Operation,
        business_id: impl Into<String>,
        root_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            path: path.into(),
            operation,
            business_id: business_id.into(),
            root_path: root_path.into(),
            observed_at: Instant::now(),
        }
    }
}

impl fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({})",
            self.operation,
            self.path.display(),
            self.business_id
        )
    }
}
