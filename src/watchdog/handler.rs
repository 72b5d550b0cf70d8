//! Output sink trait and the per-business ordered chain.

use std::sync::Arc;

use async_trait::async_trait;

use super::error::HandlerError;
use super::record::FileRecord;

/// An output destination for shipped files.
///
/// Handlers log through the process-wide `tracing` subscriber; there is no
/// per-handler logger to inject.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handler name for logging.
    fn name(&self) -> &str;

    /// Higher runs first.
    fn priority(&self) -> i32;

    /// Ship one file.
    async fn handle(&self, record: &FileRecord) -> Result<(), HandlerError>;

    /// Undo a successful `handle` after a later handler failed.
    ///
    /// Best effort; errors are logged by the caller and go no further.
    async fn rollback(&self, _record: &FileRecord) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Handlers sorted by descending priority, ties in registration order.
#[derive(Clone, Default)]
pub struct HandlerChain {
    handlers: Vec<Arc<dyn Handler>>,
}

impl HandlerChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert keeping the chain ordered. Stable: equal priorities keep
    /// their registration order.
    pub fn push(&mut self, handler: Arc<dyn Handler>) {
        let priority = handler.priority();
        let at = self
            .handlers
            .iter()
            .position(|h| h.priority() < priority)
            .unwrap_or(self.handlers.len());
        self.handlers.insert(at, handler);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Handler>> {
        self.handlers.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.handlers.iter().map(|h| (h.name(), h.priority())))
            .finish()
    }
}
