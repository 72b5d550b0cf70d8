//! Recursive OS-notification watcher with a liveness guard.
//!
//! One [`Session`] is a `notify` watcher plus the set of directories it has
//! registered. Directories are watched non-recursively, one by one, so the
//! include/exclude filters and the depth limit decide exactly what is
//! covered. New directories are registered as their CREATE arrives.
//!
//! Network shares can vanish under a live session. The session then either
//! reports errors or simply goes silent, so the guard probes the monitor
//! root on a fixed interval and rebuilds the session once it is reachable
//! again.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use super::error::WatchError;
use super::event::{ChangeEvent, Operation};
use super::rule::Rule;

/// Health of the watch session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessState {
    Active,
    /// The watch target became unreachable; waiting for a probe to succeed.
    Degraded,
}

/// What the guard wants done after a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardAction {
    None,
    Restart,
}

/// Active/Degraded state machine driving session restarts.
#[derive(Debug)]
pub struct LivenessGuard {
    state: LivenessState,
}

impl Default for LivenessGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl LivenessGuard {
    pub fn new() -> Self {
        Self {
            state: LivenessState::Active,
        }
    }

    pub fn state(&self) -> LivenessState {
        self.state
    }

    /// The session reported an error or lost its root. Returns `true` on
    /// the Active -> Degraded transition.
    pub fn on_error(&mut self) -> bool {
        let was_active = self.state == LivenessState::Active;
        self.state = LivenessState::Degraded;
        was_active
    }

    /// Feed a probe result.
    pub fn on_probe(&mut self, reachable: bool) -> GuardAction {
        match (self.state, reachable) {
            (LivenessState::Active, false) => {
                self.state = LivenessState::Degraded;
                GuardAction::None
            }
            (LivenessState::Degraded, true) => {
                self.state = LivenessState::Active;
                GuardAction::Restart
            }
            _ => GuardAction::None,
        }
    }
}

/// One live `notify` subscription for a rule.
pub struct Session {
    watcher: RecommendedWatcher,
    rx: mpsc::Receiver<notify::Result<Event>>,
    watched: HashSet<PathBuf>,
    closed: bool,
}

impl Session {
    /// Create the watcher and register the whole tree.
    ///
    /// Fails if the monitor root is missing or cannot be watched.
    pub fn open(rule: &Rule, capacity: usize) -> Result<Self, WatchError> {
        let root = rule.monitor_path();
        match std::fs::metadata(&root) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(WatchError::RootUnreachable {
                    path: root,
                    reason: "not a directory".to_string(),
                });
            }
            Err(e) => {
                return Err(WatchError::RootUnreachable {
                    path: root,
                    reason: e.to_string(),
                });
            }
        }

        let (tx, rx) = mpsc::channel(capacity.max(1));
        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.blocking_send(res);
        })?;

        let mut session = Self {
            watcher,
            rx,
            watched: HashSet::new(),
            closed: false,
        };

        session
            .watcher
            .watch(&root, RecursiveMode::NonRecursive)
            .map_err(|e| WatchError::PathWatchFailed {
                path: root.clone(),
                reason: e.to_string(),
            })?;
        session.watched.insert(root.clone());
        session.register_tree(rule, &root, false);

        crate::debug_event!(
            "native",
            "session opened",
            "{} ({} directories)",
            root.display(),
            session.watched.len()
        );
        Ok(session)
    }

    pub fn watched_count(&self) -> usize {
        self.watched.len()
    }

    pub fn is_watching(&self, dir: &Path) -> bool {
        self.watched.contains(dir)
    }

    /// Watch every accepted directory under `dir` within the depth limit.
    ///
    /// With `emit_files`, returns CREATE events for files already present
    /// in the newly registered directories (they may predate the watch).
    fn register_tree(&mut self, rule: &Rule, dir: &Path, emit_files: bool) -> Vec<ChangeEvent> {
        let mut found = Vec::new();
        let walker = WalkDir::new(dir)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| {
                if !entry.file_type().is_dir() {
                    return true;
                }
                let path = entry.path();
                match rule.depth_of(path) {
                    Some(depth) => rule.within_depth(depth) && (depth == 0 || rule.accepts_dir(path)),
                    None => false,
                }
            });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("[native] walk error under {}: {e}", dir.display());
                    continue;
                }
            };
            let path = entry.path();

            if entry.file_type().is_dir() {
                if self.watched.contains(path) {
                    continue;
                }
                match self.watcher.watch(path, RecursiveMode::NonRecursive) {
                    Ok(()) => {
                        self.watched.insert(path.to_path_buf());
                        crate::debug_event!("native", "watching", "{}", path.display());
                    }
                    Err(e) => {
                        // Keep going; siblings may still be watchable
                        tracing::warn!("[native] failed to watch {}: {e}", path.display());
                    }
                }
            } else if emit_files && entry.file_type().is_file() && rule.accepts_file(path) {
                found.push(ChangeEvent::new(
                    path,
                    Operation::Create,
                    &rule.business_id,
                    &rule.root_path,
                ));
            }
        }
        found
    }

    /// Drop `gone` and every registered directory below it.
    ///
    /// A directory moved out of the tree keeps its inotify watches on the
    /// old inodes; they must not shadow a tree recreated at the same paths.
    fn forget_subtree(&mut self, gone: &Path) {
        let stale: Vec<PathBuf> = self
            .watched
            .iter()
            .filter(|dir| dir.starts_with(gone))
            .cloned()
            .collect();
        for dir in stale {
            let _ = self.watcher.unwatch(&dir);
            self.watched.remove(&dir);
            crate::debug_event!("native", "unwatched", "{}", dir.display());
        }
    }

    /// Reduce a raw notification to filtered change events.
    ///
    /// Returns `Err(())` when the event signals that the monitor root itself
    /// went away.
    fn translate(&mut self, rule: &Rule, event: Event) -> Result<Vec<ChangeEvent>, ()> {
        let operation = match event.kind {
            EventKind::Create(_) => Operation::Create,
            EventKind::Modify(ModifyKind::Name(_)) => Operation::Rename,
            EventKind::Modify(_) => Operation::Write,
            EventKind::Remove(_) => Operation::Remove,
            _ => return Ok(Vec::new()),
        };

        let root = rule.monitor_path();
        let mut out = Vec::new();

        for path in event.paths {
            let Some(depth) = rule.depth_of(&path) else {
                continue;
            };
            if depth == 0 {
                if matches!(operation, Operation::Remove | Operation::Rename) && !root.exists() {
                    return Err(());
                }
                continue;
            }

            let is_dir = std::fs::symlink_metadata(&path)
                .map(|m| m.is_dir())
                .unwrap_or(false);

            if is_dir {
                if !rule.accepts_dir(&path) {
                    continue;
                }
                match operation {
                    // Side effect of a child changing
                    Operation::Write => continue,
                    Operation::Create | Operation::Rename if rule.within_depth(depth) => {
                        out.extend(self.register_tree(rule, &path, true));
                    }
                    _ => {}
                }
            } else {
                if operation == Operation::Remove || operation == Operation::Rename {
                    self.forget_subtree(&path);
                }
                if !rule.accepts_file(&path) {
                    crate::debug_event!("native", "filtered", "{}", path.display());
                    continue;
                }
            }

            out.push(ChangeEvent::new(
                path,
                operation,
                &rule.business_id,
                &rule.root_path,
            ));
        }
        Ok(out)
    }
}

/// Native watcher for one rule.
#[derive(Debug, Clone)]
pub struct NativeWatcher {
    liveness_interval: Duration,
    channel_capacity: usize,
}

impl NativeWatcher {
    pub fn new(liveness_interval: Duration) -> Self {
        Self {
            liveness_interval,
            channel_capacity: 100,
        }
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Watch `rule` and feed `tx` until shutdown.
    ///
    /// Only setup errors are returned. Once running, watch-layer failures
    /// are handled by the liveness guard and never reach `tx`.
    pub async fn listen(
        &self,
        rule: Rule,
        tx: mpsc::Sender<ChangeEvent>,
        shutdown: CancellationToken,
    ) -> Result<(), WatchError> {
        let mut session = Session::open(&rule, self.channel_capacity)?;
        let mut guard = LivenessGuard::new();
        let root = rule.monitor_path();

        crate::log_event!(
            "native",
            "started",
            "{} at {} ({} directories)",
            rule.business_id,
            root.display(),
            session.watched_count()
        );

        let mut probe = tokio::time::interval(self.liveness_interval);
        probe.set_missed_tick_behavior(MissedTickBehavior::Delay);
        probe.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    crate::debug_event!("native", "stopped", "{}", rule.business_id);
                    return Ok(());
                }

                received = session.rx.recv(), if !session.closed => {
                    match received {
                        Some(Ok(event)) => match session.translate(&rule, event) {
                            Ok(changes) => {
                                for change in changes {
                                    tx.send(change).await.map_err(|_| WatchError::ChannelClosed)?;
                                }
                            }
                            Err(()) => {
                                if guard.on_error() {
                                    tracing::warn!(
                                        "[native] {} root {} disappeared, waiting for it to return",
                                        rule.business_id,
                                        root.display()
                                    );
                                }
                            }
                        },
                        Some(Err(e)) => {
                            if guard.on_error() {
                                tracing::warn!(
                                    "[native] {} watch error, degraded: {e}",
                                    rule.business_id
                                );
                            }
                        }
                        None => {
                            session.closed = true;
                            guard.on_error();
                        }
                    }
                }

                _ = probe.tick() => {
                    let reachable = tokio::fs::metadata(&root)
                        .await
                        .is_ok_and(|meta| meta.is_dir());

                    if guard.on_probe(reachable) == GuardAction::Restart {
                        match Session::open(&rule, self.channel_capacity) {
                            Ok(fresh) => {
                                session = fresh;
                                crate::log_event!(
                                    "native",
                                    "recovered",
                                    "{} ({} directories)",
                                    rule.business_id,
                                    session.watched_count()
                                );
                            }
                            Err(e) => {
                                tracing::warn!(
                                    "[native] {} restart failed: {e}",
                                    rule.business_id
                                );
                                guard.on_error();
                            }
                        }
                    } else if !reachable && guard.state() == LivenessState::Degraded {
                        crate::debug_event!("native", "probe failed", "{}", root.display());
                    }
                }
            }
        }
    }
}
