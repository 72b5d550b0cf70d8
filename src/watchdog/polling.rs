//! Periodic backfill walk.
//!
//! Catches files that existed before the agent started or slipped past the
//! native watcher. Every file whose modification time is not already in
//! seen-state produces a synthetic LOAD event, so a second poll over an
//! unchanged tree emits nothing.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use ignore::{WalkBuilder, WalkState};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::error::WatchError;
use super::event::{ChangeEvent, Operation};
use super::rule::Rule;
use super::seen_state::SeenState;

/// Full-tree poller for one or more rules.
#[derive(Clone)]
pub struct PollingWatcher {
    interval: Duration,
    threads: usize,
    seen: SeenState,
}

impl PollingWatcher {
    pub fn new(seen: SeenState, interval: Duration, threads: usize) -> Self {
        Self {
            interval,
            threads: threads.max(1),
            seen,
        }
    }

    /// Walk `rule` once and return LOAD events for new or changed files.
    ///
    /// The native depth limit does not apply here.
    pub async fn scan(&self, rule: &Rule) -> Result<Vec<ChangeEvent>, WatchError> {
        let rule = rule.unlimited();
        let seen = self.seen.clone();
        let threads = self.threads;

        tokio::task::spawn_blocking(move || scan_blocking(&rule, &seen, threads))
            .await
            .map_err(|e| WatchError::EventError {
                details: format!("poll task failed: {e}"),
            })
    }

    /// Walk once and push the resulting events into `tx`.
    pub async fn poll_once(
        &self,
        rule: &Rule,
        tx: &mpsc::Sender<ChangeEvent>,
    ) -> Result<usize, WatchError> {
        let events = self.scan(rule).await?;
        let count = events.len();
        for event in events {
            tx.send(event).await.map_err(|_| WatchError::ChannelClosed)?;
        }
        Ok(count)
    }

    /// Poll immediately, then every interval, until shutdown.
    pub async fn listen(
        &self,
        rule: Rule,
        tx: mpsc::Sender<ChangeEvent>,
        shutdown: CancellationToken,
    ) -> Result<(), WatchError> {
        crate::log_event!(
            "polling",
            "started",
            "{} every {}s",
            rule.business_id,
            self.interval.as_secs()
        );

        loop {
            let count = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                result = self.poll_once(&rule, &tx) => result?,
            };

            if count > 0 {
                crate::log_event!("polling", "backfill", "{}: {count} files", rule.business_id);
            } else {
                crate::debug_event!("polling", "no changes", "{}", rule.business_id);
            }

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}

fn scan_blocking(rule: &Rule, seen: &SeenState, threads: usize) -> Vec<ChangeEvent> {
    let root = rule.monitor_path();
    if !root.is_dir() {
        tracing::warn!(
            "[polling] {} root {} is not reachable, skipping this cycle",
            rule.business_id,
            root.display()
        );
        return Vec::new();
    }

    let found: Arc<Mutex<Vec<PathBuf>>> = Arc::new(Mutex::new(Vec::new()));
    let dir_rule = rule.clone();

    let walker = WalkBuilder::new(&root)
        .standard_filters(false)
        .follow_links(false)
        .threads(threads)
        .filter_entry(move |entry| {
            let is_dir = entry.file_type().is_some_and(|ft| ft.is_dir());
            !is_dir || entry.depth() == 0 || dir_rule.accepts_dir(entry.path())
        })
        .build_parallel();

    walker.run(|| {
        let found = Arc::clone(&found);
        Box::new(move |entry| {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::debug!("[polling] walk error: {e}");
                    return WalkState::Continue;
                }
            };

            if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                return WalkState::Continue;
            }

            let path = entry.path();
            if !rule.accepts_file(path) {
                return WalkState::Continue;
            }

            let modified = match entry.metadata().ok().and_then(|m| m.modified().ok()) {
                Some(t) => DateTime::<Local>::from(t),
                None => return WalkState::Continue,
            };

            match seen.is_unchanged(path, modified) {
                Ok(true) => {}
                Ok(false) => found.lock().push(path.to_path_buf()),
                Err(e) => {
                    tracing::warn!("[polling] seen-state lookup failed for {}: {e}", path.display());
                    found.lock().push(path.to_path_buf());
                }
            }
            WalkState::Continue
        })
    });

    let mut paths = std::mem::take(&mut *found.lock());
    paths.sort();
    paths
        .into_iter()
        .map(|path| ChangeEvent::new(path, Operation::Load, &rule.business_id, &rule.root_path))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_scan_emits_load_for_unseen_files() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("a/b/c/d")).unwrap();
        fs::write(root.join("top.csv"), "1").unwrap();
        fs::write(root.join("a/b/c/d/deep.csv"), "2").unwrap();
        fs::write(root.join("a/skip.tmp"), "3").unwrap();

        // depth limit is for the native watcher only
        let rule = Rule::new("T1", root)
            .with_max_depth(1)
            .with_include(r"\.csv$")
            .unwrap();
        let poller = PollingWatcher::new(SeenState::temporary().unwrap(), Duration::from_secs(60), 2);

        let events = poller.scan(&rule).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.operation == Operation::Load));
        assert!(events.iter().any(|e| e.path == root.join("a/b/c/d/deep.csv")));
    }

    #[tokio::test]
    async fn test_scan_skips_files_marked_unchanged() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let file = root.join("x.log");
        fs::write(&file, "x").unwrap();

        let seen = SeenState::temporary().unwrap();
        let modified = DateTime::<Local>::from(fs::metadata(&file).unwrap().modified().unwrap());
        seen.mark(&file, modified, None).unwrap();

        let poller = PollingWatcher::new(seen, Duration::from_secs(60), 2);
        assert!(poller.scan(&Rule::new("T1", root)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_excluded_directories_are_not_walked() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("archive")).unwrap();
        fs::write(root.join("archive/old.csv"), "1").unwrap();
        fs::write(root.join("new.csv"), "1").unwrap();

        let rule = Rule::new("T1", root).with_exclude("/archive").unwrap();
        let poller = PollingWatcher::new(SeenState::temporary().unwrap(), Duration::from_secs(60), 1);

        let events = poller.scan(&rule).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].path, root.join("new.csv"));
    }

    #[tokio::test]
    async fn test_missing_root_yields_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let rule = Rule::new("T1", temp_dir.path().join("gone"));
        let poller = PollingWatcher::new(SeenState::temporary().unwrap(), Duration::from_secs(60), 1);
        assert!(poller.scan(&rule).await.unwrap().is_empty());
    }
}
