//! Per-path coalescing of change events.
//!
//! Files under test equipment are often written in many small flushes, each
//! raising a WRITE. The debouncer keeps one slot per path: a new event
//! replaces the buffered one and restarts that path's timer, and only when
//! the timer expires does the last event go downstream.
//!
//! State lives in [`Debouncer`]; [`run_debouncer`] owns it from a single
//! task, so a timer firing and a new event for the same path can never
//! interleave.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::error::WatchError;
use super::event::{ChangeEvent, Operation};

#[derive(Debug)]
struct Pending {
    event: ChangeEvent,
    deadline: Instant,
}

/// Debounces change events by path.
#[derive(Debug)]
pub struct Debouncer {
    /// Buffered event and expiry per path.
    pending: HashMap<PathBuf, Pending>,
    default_interval: Duration,
    /// Per-business overrides.
    intervals: HashMap<String, Duration>,
}

impl Debouncer {
    pub fn new(default_interval: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            default_interval,
            intervals: HashMap::new(),
        }
    }

    /// Use `interval` for events of `business_id`.
    pub fn set_interval(&mut self, business_id: impl Into<String>, interval: Duration) {
        self.intervals.insert(business_id.into(), interval);
    }

    pub fn interval_for(&self, business_id: &str) -> Duration {
        self.intervals
            .get(business_id)
            .copied()
            .unwrap_or(self.default_interval)
    }

    /// Record an event observed now.
    pub fn record(&mut self, event: ChangeEvent) -> bool {
        self.record_at(event, Instant::now())
    }

    /// Buffer `event` and (re)start its path's timer at `now`.
    ///
    /// The newest event replaces the buffered one, except that a WRITE
    /// landing on a buffered CREATE stays a CREATE: downstream the file is
    /// still new. Returns `true` when an earlier buffered event was replaced.
    pub fn record_at(&mut self, mut event: ChangeEvent, now: Instant) -> bool {
        let deadline = now + self.interval_for(&event.business_id);
        if event.operation == Operation::Write
            && self
                .pending
                .get(&event.path)
                .is_some_and(|p| p.event.operation == Operation::Create)
        {
            event.operation = Operation::Create;
        }
        self.pending
            .insert(event.path.clone(), Pending { event, deadline })
            .is_some()
    }

    pub fn take_ready(&mut self) -> Vec<ChangeEvent> {
        self.take_ready_at(Instant::now())
    }

    /// Remove and return every event whose timer has expired by `now`,
    /// earliest deadline first.
    pub fn take_ready_at(&mut self, now: Instant) -> Vec<ChangeEvent> {
        let mut ready = Vec::new();
        self.pending.retain(|_, pending| {
            if pending.deadline <= now {
                ready.push((pending.deadline, pending.event.clone()));
                false
            } else {
                true
            }
        });
        ready.sort_by_key(|(deadline, _)| *deadline);
        ready.into_iter().map(|(_, event)| event).collect()
    }

    /// Earliest pending expiry, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Everything still buffered, regardless of timers.
    pub fn drain(&mut self) -> Vec<ChangeEvent> {
        let mut all: Vec<_> = self.pending.drain().map(|(_, p)| p).collect();
        all.sort_by_key(|p| p.deadline);
        all.into_iter().map(|p| p.event).collect()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Drive a debouncer between two queues until shutdown.
///
/// When the input closes, buffered events are flushed immediately.
pub async fn run_debouncer(
    mut rx: mpsc::Receiver<ChangeEvent>,
    tx: mpsc::Sender<ChangeEvent>,
    mut debouncer: Debouncer,
    shutdown: CancellationToken,
) -> Result<(), WatchError> {
    const IDLE: Duration = Duration::from_secs(3600);

    loop {
        let deadline = debouncer
            .next_deadline()
            .unwrap_or_else(|| Instant::now() + IDLE);
        let timer = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline));

        tokio::select! {
            _ = shutdown.cancelled() => {
                if debouncer.has_pending() {
                    crate::debug_event!(
                        "debouncer",
                        "dropped on shutdown",
                        "{} pending",
                        debouncer.pending_count()
                    );
                }
                return Ok(());
            }

            received = rx.recv() => {
                match received {
                    Some(event) => {
                        if debouncer.record(event) {
                            crate::debug_event!("debouncer", "coalesced");
                        }
                    }
                    None => {
                        for event in debouncer.drain() {
                            tx.send(event).await.map_err(|_| WatchError::ChannelClosed)?;
                        }
                        return Ok(());
                    }
                }
            }

            _ = timer, if debouncer.has_pending() => {
                for event in debouncer.take_ready() {
                    crate::debug_event!("debouncer", "fired", "{event}");
                    tx.send(event).await.map_err(|_| WatchError::ChannelClosed)?;
                }
            }
        }
    }
}
