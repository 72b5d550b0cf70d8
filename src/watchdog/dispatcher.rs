//! Bounded worker pool that ships files through their handler chain.
//!
//! Per file, strictly in order:
//!
//! ```text
//! resolve (stat + read) --fail--> Handle404Error, drop
//!   -> seen-state unchanged? drop
//!   -> CheckFile --fail--> drop (logged)
//!   -> Transform --fail--> drop (reported)
//!   -> handlers, highest priority first --fail--> rollback succeeded ones
//!   -> seen-state write
//! ```
//!
//! Files are independent of each other; no ordering holds across them.
//! A path is processed by one worker at a time. An event arriving for a busy
//! path is parked with its worker and run right after the current pass, so a
//! rewrite during shipping is never lost.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::error::WatchError;
use super::event::ChangeEvent;
use super::handler::{Handler, HandlerChain};
use super::hook::{Hook, HookContext, HookRegistry};
use super::record::{FileRecord, Resolved};
use super::seen_state::SeenState;

/// What happened to one dispatched event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Every handler succeeded and seen-state was updated.
    Shipped,
    /// The file could not be stat'ed or read.
    Vanished,
    Directory,
    /// Same modification time as the last shipped version.
    Unchanged,
    /// Another worker is processing this path; it re-runs with this event.
    InFlight,
    /// A business hook refused the file.
    Rejected(Hook),
    /// A handler failed; earlier handlers were rolled back.
    ChainFailed { handler: String },
    /// No handler chain registered for the business.
    NoChain,
}

struct Shared {
    registry: HookRegistry,
    chains: BTreeMap<String, HandlerChain>,
    seen: SeenState,
    ctx: HookContext,
    /// Paths being processed, each with the newest event parked behind it.
    in_flight: DashMap<PathBuf, Option<ChangeEvent>>,
}

/// Releases a path if its task is cancelled or panics mid-pass.
struct InFlightGuard<'a> {
    map: &'a DashMap<PathBuf, Option<ChangeEvent>>,
    path: PathBuf,
    armed: bool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.map.remove(&self.path);
        }
    }
}

/// Executes file tasks. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
    workers: usize,
}

impl Dispatcher {
    pub fn new(
        registry: HookRegistry,
        chains: BTreeMap<String, HandlerChain>,
        seen: SeenState,
        host_id: impl Into<String>,
        workers: usize,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry,
                chains,
                seen,
                ctx: HookContext::new(host_id),
                in_flight: DashMap::new(),
            }),
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Process a single event end to end.
    ///
    /// If the path is already being processed, the event is parked with that
    /// worker instead, which runs it again once the current pass finishes.
    /// Only the newest parked event is kept.
    pub async fn process_file(&self, event: ChangeEvent) -> Outcome {
        let shared = &*self.shared;
        let path = event.path.clone();

        match shared.in_flight.entry(path.clone()) {
            Entry::Occupied(mut parked) => {
                crate::debug_event!("dispatcher", "parked behind in-flight", "{}", path.display());
                *parked.get_mut() = Some(event);
                return Outcome::InFlight;
            }
            Entry::Vacant(slot) => {
                slot.insert(None);
            }
        }
        let mut guard = InFlightGuard {
            map: &shared.in_flight,
            path: path.clone(),
            armed: true,
        };

        let mut event = event;
        loop {
            let span = crate::logging::file_span(&event.business_id, &event.path, event.operation);
            let outcome = self.ship(event).instrument(span).await;

            // release only if nothing was parked meanwhile, atomically
            if shared
                .in_flight
                .remove_if(&path, |_, parked| parked.is_none())
                .is_some()
            {
                guard.armed = false;
                return outcome;
            }
            match shared.in_flight.get_mut(&path).and_then(|mut parked| parked.take()) {
                Some(next) => {
                    crate::debug_event!("dispatcher", "re-running", "{next}");
                    event = next;
                }
                None => return outcome,
            }
        }
    }

    /// One pass over a file: resolve, hooks, chain, seen-state.
    async fn ship(&self, event: ChangeEvent) -> Outcome {
        let shared = &*self.shared;

        let mut record = match FileRecord::resolve(&event, &shared.ctx.host_id).await {
            Ok(Resolved::File(record)) => record,
            Ok(Resolved::Directory) => return Outcome::Directory,
            Err(e) => {
                crate::debug_event!("dispatcher", "vanished", "{event}: {e}");
                if let Err(hook_err) = shared.registry.handle_404(&shared.ctx, &event, &e) {
                    tracing::warn!("[dispatcher] {hook_err}");
                }
                return Outcome::Vanished;
            }
        };

        match shared.seen.is_unchanged(&record.absolute_path, record.modify_time) {
            Ok(true) => {
                crate::debug_event!("dispatcher", "unchanged", "{}", record.absolute_path.display());
                return Outcome::Unchanged;
            }
            Ok(false) => {}
            Err(e) => tracing::warn!("[dispatcher] seen-state lookup failed: {e}"),
        }

        if let Err(e) = shared.registry.check_file(&shared.ctx, &record) {
            crate::log_event!("dispatcher", "rejected", "{event}: {e}");
            return Outcome::Rejected(Hook::CheckFile);
        }

        if let Err(e) = shared.registry.transform(&shared.ctx, &mut record) {
            tracing::warn!(
                "[dispatcher] transform failed for {} {} ({}): {e}",
                event.business_id,
                event.path.display(),
                event.operation
            );
            return Outcome::Rejected(Hook::Transform);
        }

        let Some(chain) = shared.chains.get(&event.business_id) else {
            tracing::warn!(
                "[dispatcher] no handlers registered for business '{}', {} left unshipped",
                event.business_id,
                event.path.display()
            );
            return Outcome::NoChain;
        };

        if let Err(handler) = run_chain(chain, &record).await {
            return Outcome::ChainFailed { handler };
        }

        if let Err(e) = shared.seen.mark(
            &record.absolute_path,
            record.modify_time,
            Some(&record.checksum),
        ) {
            tracing::error!(
                "[dispatcher] shipped {} but could not record it: {e}",
                record.absolute_path.display()
            );
        }

        crate::log_event!(
            "dispatcher",
            "shipped",
            "{} {} {} ({} bytes)",
            event.business_id,
            event.operation,
            event.path.display(),
            record.size_bytes
        );
        Outcome::Shipped
    }

    /// Consume batches until the queue closes or shutdown, then wait for
    /// in-flight tasks.
    pub async fn run(
        &self,
        mut rx: mpsc::Receiver<Vec<ChangeEvent>>,
        shutdown: CancellationToken,
    ) -> Result<(), WatchError> {
        let permits = Arc::new(Semaphore::new(self.workers));
        let mut tasks: JoinSet<Outcome> = JoinSet::new();

        crate::log_event!("dispatcher", "started", "{} workers", self.workers);

        'outer: loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                batch = rx.recv() => {
                    let Some(batch) = batch else { break };
                    crate::debug_event!("dispatcher", "batch", "{} events", batch.len());

                    for event in batch {
                        let permit = tokio::select! {
                            _ = shutdown.cancelled() => break 'outer,
                            permit = Arc::clone(&permits).acquire_owned() => {
                                permit.map_err(|_| WatchError::ChannelClosed)?
                            }
                        };
                        let dispatcher = self.clone();
                        tasks.spawn(async move {
                            let _permit = permit;
                            dispatcher.process_file(event).await
                        });
                    }

                    while let Some(joined) = tasks.try_join_next() {
                        reap(joined);
                    }
                }

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => reap(joined),
            }
        }

        while let Some(joined) = tasks.join_next().await {
            reap(joined);
        }
        crate::debug_event!("dispatcher", "stopped");
        Ok(())
    }
}

fn reap(joined: Result<Outcome, tokio::task::JoinError>) {
    if let Err(e) = joined {
        tracing::error!("[dispatcher] file task panicked: {e}");
    }
}

/// Run handlers in order. On failure, roll back the ones that succeeded and
/// return the failing handler's name.
async fn run_chain(chain: &HandlerChain, record: &FileRecord) -> Result<(), String> {
    let mut succeeded: Vec<&Arc<dyn Handler>> = Vec::with_capacity(chain.len());

    for handler in chain.iter() {
        match handler.handle(record).await {
            Ok(()) => succeeded.push(handler),
            Err(e) => {
                let event = &record.originating_event;
                tracing::error!(
                    "[dispatcher] handler '{}' failed for {} {} ({}): {e}",
                    handler.name(),
                    event.business_id,
                    record.absolute_path.display(),
                    event.operation
                );

                for done in succeeded {
                    if let Err(rollback_err) = done.rollback(record).await {
                        tracing::warn!(
                            "[dispatcher] rollback of '{}' failed for {}: {rollback_err}",
                            done.name(),
                            record.absolute_path.display()
                        );
                    }
                }
                return Err(handler.name().to_string());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watchdog::error::{HandlerError, HookError};
    use crate::watchdog::event::Operation;
    use crate::watchdog::hook::{CheckFile, Plugin};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::fs;
    use tempfile::TempDir;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recording {
        name: &'static str,
        priority: i32,
        fail: bool,
        log: Log,
    }

    #[async_trait]
    impl Handler for Recording {
        fn name(&self) -> &str {
            self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        async fn handle(&self, record: &FileRecord) -> Result<(), HandlerError> {
            self.log.lock().push(format!("{}:handle", self.name));
            if self.fail {
                return Err(HandlerError::Rejected {
                    handler: self.name.to_string(),
                    path: record.absolute_path.clone(),
                    reason: "sink down".to_string(),
                });
            }
            Ok(())
        }

        async fn rollback(&self, _record: &FileRecord) -> Result<(), HandlerError> {
            self.log.lock().push(format!("{}:rollback", self.name));
            Ok(())
        }
    }

    struct RejectAll;

    impl CheckFile for RejectAll {
        fn check_file(&self, _ctx: &HookContext, _record: &FileRecord) -> Result<(), HookError> {
            Err(HookError::new("gate", Hook::CheckFile, "not ready"))
        }
    }

    impl Plugin for RejectAll {
        fn name(&self) -> &str {
            "gate"
        }

        fn as_check_file(&self) -> Option<&dyn CheckFile> {
            Some(self)
        }
    }

    fn handler(name: &'static str, priority: i32, fail: bool, log: &Log) -> Arc<dyn Handler> {
        Arc::new(Recording {
            name,
            priority,
            fail,
            log: Arc::clone(log),
        })
    }

    fn dispatcher_with(chain: HandlerChain, registry: HookRegistry, seen: SeenState) -> Dispatcher {
        let mut chains = BTreeMap::new();
        chains.insert("T1".to_string(), chain);
        Dispatcher::new(registry, chains, seen, "station-7", 2)
    }

    #[tokio::test]
    async fn test_failed_handler_stops_chain_and_rolls_back() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("a.txt");
        fs::write(&file, "x").unwrap();

        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = HandlerChain::new();
        chain.push(handler("third", 1, false, &log));
        chain.push(handler("first", 3, false, &log));
        chain.push(handler("second", 2, true, &log));

        let seen = SeenState::temporary().unwrap();
        let dispatcher = dispatcher_with(chain, HookRegistry::new(), seen.clone());

        let event = ChangeEvent::new(&file, Operation::Create, "T1", temp_dir.path());
        let outcome = dispatcher.process_file(event).await;

        assert_eq!(
            outcome,
            Outcome::ChainFailed {
                handler: "second".to_string()
            }
        );
        assert_eq!(
            *log.lock(),
            vec!["first:handle", "second:handle", "first:rollback"]
        );
        assert!(seen.get(&file).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_success_marks_seen_and_repeat_is_unchanged() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("a.txt");
        fs::write(&file, "x").unwrap();

        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = HandlerChain::new();
        chain.push(handler("only", 0, false, &log));

        let seen = SeenState::temporary().unwrap();
        let dispatcher = dispatcher_with(chain, HookRegistry::new(), seen.clone());

        let event = ChangeEvent::new(&file, Operation::Write, "T1", temp_dir.path());
        assert_eq!(dispatcher.process_file(event.clone()).await, Outcome::Shipped);
        assert!(seen.get(&file).unwrap().is_some());

        assert_eq!(dispatcher.process_file(event).await, Outcome::Unchanged);
        assert_eq!(log.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_check_file_rejection_ships_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("a.txt");
        fs::write(&file, "x").unwrap();

        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = HandlerChain::new();
        chain.push(handler("only", 0, false, &log));

        let mut registry = HookRegistry::new();
        registry.import([Arc::new(RejectAll) as Arc<dyn Plugin>]);

        let seen = SeenState::temporary().unwrap();
        let dispatcher = dispatcher_with(chain, registry, seen.clone());

        let event = ChangeEvent::new(&file, Operation::Create, "T1", temp_dir.path());
        assert_eq!(
            dispatcher.process_file(event).await,
            Outcome::Rejected(Hook::CheckFile)
        );
        assert!(log.lock().is_empty());
        assert!(seen.is_empty());
    }

    #[tokio::test]
    async fn test_vanished_and_directory_events() {
        let temp_dir = TempDir::new().unwrap();
        let dispatcher = dispatcher_with(
            HandlerChain::new(),
            HookRegistry::new(),
            SeenState::temporary().unwrap(),
        );

        let gone = ChangeEvent::new(
            temp_dir.path().join("gone.txt"),
            Operation::Remove,
            "T1",
            temp_dir.path(),
        );
        assert_eq!(dispatcher.process_file(gone).await, Outcome::Vanished);

        let dir = ChangeEvent::new(temp_dir.path(), Operation::Create, "T1", temp_dir.path());
        assert_eq!(dispatcher.process_file(dir).await, Outcome::Directory);
    }

    /// Captures content and takes its time, so a rewrite can land mid-chain.
    struct SlowCopy {
        shipped: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Handler for SlowCopy {
        fn name(&self) -> &str {
            "slow"
        }

        fn priority(&self) -> i32 {
            0
        }

        async fn handle(&self, record: &FileRecord) -> Result<(), HandlerError> {
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            self.shipped
                .lock()
                .push(String::from_utf8_lossy(&record.content_bytes).into_owned());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_rewrite_during_shipping_is_shipped_after() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("a.txt");
        fs::write(&file, "v1").unwrap();

        let shipped = Arc::new(Mutex::new(Vec::new()));
        let mut chain = HandlerChain::new();
        chain.push(Arc::new(SlowCopy {
            shipped: Arc::clone(&shipped),
        }));
        let seen = SeenState::temporary().unwrap();
        let dispatcher = dispatcher_with(chain, HookRegistry::new(), seen.clone());

        let first = {
            let dispatcher = dispatcher.clone();
            let event = ChangeEvent::new(&file, Operation::Create, "T1", temp_dir.path());
            tokio::spawn(async move { dispatcher.process_file(event).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        fs::write(&file, "v2-newer").unwrap();
        let later = std::time::SystemTime::now() + std::time::Duration::from_secs(5);
        fs::File::options()
            .write(true)
            .open(&file)
            .unwrap()
            .set_modified(later)
            .unwrap();
        let second = ChangeEvent::new(&file, Operation::Write, "T1", temp_dir.path());
        assert_eq!(dispatcher.process_file(second).await, Outcome::InFlight);

        assert_eq!(first.await.unwrap(), Outcome::Shipped);
        assert_eq!(*shipped.lock(), vec!["v1", "v2-newer"]);

        let entry = seen.get(&file).unwrap().unwrap();
        assert_eq!(entry.modified, chrono::DateTime::<chrono::Utc>::from(later));

        // the path is free again
        let again = ChangeEvent::new(&file, Operation::Write, "T1", temp_dir.path());
        assert_eq!(dispatcher.process_file(again).await, Outcome::Unchanged);
    }

    #[tokio::test]
    async fn test_run_processes_batches_in_parallel() {
        let temp_dir = TempDir::new().unwrap();
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = HandlerChain::new();
        chain.push(handler("only", 0, false, &log));

        let seen = SeenState::temporary().unwrap();
        let dispatcher = dispatcher_with(chain, HookRegistry::new(), seen.clone());

        let mut batch = Vec::new();
        for i in 0..5 {
            let file = temp_dir.path().join(format!("f{i}.txt"));
            fs::write(&file, "x").unwrap();
            batch.push(ChangeEvent::new(file, Operation::Create, "T1", temp_dir.path()));
        }

        let (tx, rx) = mpsc::channel(1);
        tx.send(batch).await.unwrap();
        drop(tx);

        dispatcher.run(rx, CancellationToken::new()).await.unwrap();
        assert_eq!(log.lock().len(), 5);
        assert_eq!(seen.len(), 5);
    }
}
