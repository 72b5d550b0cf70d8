//! Sink that only logs what would be shipped.

use async_trait::async_trait;

use crate::watchdog::error::HandlerError;
use crate::watchdog::handler::Handler;
use crate::watchdog::record::FileRecord;

/// Logs each file at info level. Never fails.
pub struct ConsoleHandler {
    priority: i32,
}

impl ConsoleHandler {
    pub fn new(priority: i32) -> Self {
        Self { priority }
    }
}

impl Default for ConsoleHandler {
    fn default() -> Self {
        Self::new(0)
    }
}

#[async_trait]
impl Handler for ConsoleHandler {
    fn name(&self) -> &str {
        "console"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn handle(&self, record: &FileRecord) -> Result<(), HandlerError> {
        crate::log_event!(
            "console",
            record.originating_event.operation,
            "{} [{}] {} bytes, sha256 {}",
            record.absolute_path.display(),
            record.business_id(),
            record.size_bytes,
            record.checksum
        );
        Ok(())
    }
}
