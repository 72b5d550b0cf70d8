//! Batching of debounced events ahead of the dispatcher.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::error::WatchError;
use super::event::ChangeEvent;

/// Keep only the most recent event per path.
///
/// Walks the batch newest-first and keeps the first occurrence of each
/// path; survivors are returned in arrival order.
pub fn dedupe_batch(events: Vec<ChangeEvent>) -> Vec<ChangeEvent> {
    let keep: Vec<bool> = {
        let mut seen: HashSet<&Path> = HashSet::with_capacity(events.len());
        let mut keep = vec![false; events.len()];
        for (i, event) in events.iter().enumerate().rev() {
            keep[i] = seen.insert(event.path.as_path());
        }
        keep
    };

    events
        .into_iter()
        .zip(keep)
        .filter_map(|(event, keep)| keep.then_some(event))
        .collect()
}

/// Accumulates events until a tick or the size cap.
#[derive(Debug)]
pub struct BatchCollector {
    events: Vec<ChangeEvent>,
    max_size: usize,
}

impl BatchCollector {
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            events: Vec::with_capacity(max_size),
            max_size,
        }
    }

    /// Add an event; returns `true` once the cap is reached.
    pub fn push(&mut self, event: ChangeEvent) -> bool {
        self.events.push(event);
        self.should_flush()
    }

    pub fn should_flush(&self) -> bool {
        self.events.len() >= self.max_size
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Take the deduplicated batch, leaving the collector empty.
    pub fn take(&mut self) -> Vec<ChangeEvent> {
        let raw = std::mem::replace(&mut self.events, Vec::with_capacity(self.max_size));
        dedupe_batch(raw)
    }
}

/// Group debounced events into batches flushed on `tick` or at `max_size`.
pub async fn run_batch_collector(
    mut rx: mpsc::Receiver<ChangeEvent>,
    tx: mpsc::Sender<Vec<ChangeEvent>>,
    tick: Duration,
    max_size: usize,
    shutdown: CancellationToken,
) -> Result<(), WatchError> {
    let mut collector = BatchCollector::new(max_size);
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),

            received = rx.recv() => {
                match received {
                    Some(event) => {
                        if collector.push(event) {
                            flush(&mut collector, &tx).await?;
                        }
                    }
                    None => {
                        flush(&mut collector, &tx).await?;
                        return Ok(());
                    }
                }
            }

            _ = ticker.tick() => {
                flush(&mut collector, &tx).await?;
            }
        }
    }
}

async fn flush(
    collector: &mut BatchCollector,
    tx: &mpsc::Sender<Vec<ChangeEvent>>,
) -> Result<(), WatchError> {
    if collector.is_empty() {
        return Ok(());
    }
    let batch = collector.take();
    crate::debug_event!("batch", "flush", "{} events", batch.len());
    tx.send(batch).await.map_err(|_| WatchError::ChannelClosed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watchdog::event::Operation;
    use std::path::PathBuf;

    fn event(path: &str, op: Operation) -> ChangeEvent {
        ChangeEvent::new(path, op, "T1", "/data/t1")
    }

    #[test]
    fn test_dedupe_keeps_most_recent_per_path() {
        let batch = vec![
            event("/data/t1/p", Operation::Write),
            event("/data/t1/q", Operation::Create),
            event("/data/t1/p", Operation::Remove),
        ];

        let out = dedupe_batch(batch);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].path, PathBuf::from("/data/t1/q"));
        assert_eq!(out[1].path, PathBuf::from("/data/t1/p"));
        assert_eq!(out[1].operation, Operation::Remove);
    }

    #[test]
    fn test_collector_flushes_at_cap() {
        let mut collector = BatchCollector::new(3);
        assert!(!collector.push(event("/a", Operation::Write)));
        assert!(!collector.push(event("/b", Operation::Write)));
        assert!(collector.push(event("/a", Operation::Write)));

        let batch = collector.take();
        assert_eq!(batch.len(), 2);
        assert!(collector.is_empty());
    }

    #[tokio::test]
    async fn test_run_collector_flushes_on_tick() {
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(run_batch_collector(
            in_rx,
            out_tx,
            Duration::from_millis(20),
            100,
            shutdown.clone(),
        ));

        in_tx.send(event("/a", Operation::Create)).await.unwrap();
        in_tx.send(event("/b", Operation::Create)).await.unwrap();

        let mut total = 0;
        while total < 2 {
            let batch = tokio::time::timeout(Duration::from_secs(2), out_rx.recv())
                .await
                .unwrap()
                .unwrap();
            total += batch.len();
        }
        assert_eq!(total, 2);

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }
}
