//! Composition root: plugins in, running pipeline out.
//!
//! ```text
//! NativeWatcher ─┐
//!                ├─ raw ─> run_debouncer ─> run_batch_collector ─> Dispatcher
//! PollingWatcher ┘
//! ```
//!
//! Every queue is bounded, so a slow dispatcher pushes back all the way to
//! the watchers.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;

use super::batch::run_batch_collector;
use super::debouncer::{Debouncer, run_debouncer};
use super::dispatcher::Dispatcher;
use super::error::WatchError;
use super::handler::HandlerChain;
use super::hook::{HookRegistry, Plugin, Registrar};
use super::native::NativeWatcher;
use super::polling::PollingWatcher;
use super::rule::{Rule, WatchStrategy};
use super::seen_state::SeenState;

/// Registered businesses after the lifecycle hooks have run.
pub struct Pipeline {
    pub host_id: String,
    pub rules: BTreeMap<String, Rule>,
    pub strategies: BTreeMap<String, Vec<WatchStrategy>>,
    pub chains: BTreeMap<String, HandlerChain>,
}

impl Pipeline {
    /// Strategies for a business; both when the plugin did not choose.
    pub fn strategies_for(&self, business_id: &str) -> Vec<WatchStrategy> {
        match self.strategies.get(business_id) {
            Some(list) => list.clone(),
            None => vec![WatchStrategy::Native, WatchStrategy::Polling],
        }
    }
}

/// The agent.
pub struct Watchdog {
    settings: Arc<Settings>,
    seen: SeenState,
    registry: HookRegistry,
}

impl Watchdog {
    pub fn new(settings: Arc<Settings>, seen: SeenState) -> Self {
        Self {
            settings,
            seen,
            registry: HookRegistry::new(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn seen(&self) -> &SeenState {
        &self.seen
    }

    pub fn registry(&self) -> &HookRegistry {
        &self.registry
    }

    /// Import plugins; inactive ones are dropped. Returns how many were kept.
    pub fn load_plugins(&mut self, plugins: impl IntoIterator<Item = Arc<dyn Plugin>>) -> usize {
        self.registry.import(plugins)
    }

    /// Fire AutoCheck, AutoInit and Mount, then validate what was registered.
    pub fn prepare(&self) -> Result<Pipeline, WatchError> {
        self.settings
            .watchdog
            .validate()
            .map_err(|e| WatchError::InitFailed {
                reason: e.to_string(),
            })?;

        let mut registrar = Registrar::new(
            self.settings.agent.hostname.clone(),
            Arc::clone(&self.settings),
        );
        self.registry.run_lifecycle(&mut registrar)?;

        let registration = registrar.into_parts();
        for rule in registration.rules.values() {
            if !rule.root_path.is_dir() {
                return Err(WatchError::RootUnreachable {
                    path: rule.root_path.clone(),
                    reason: format!("watch root of business '{}' is not a directory", rule.business_id),
                });
            }
            if !registration.chains.contains_key(&rule.business_id) {
                tracing::warn!(
                    "[watchdog] business '{}' has no handlers; its files will not be shipped",
                    rule.business_id
                );
            }
        }

        Ok(Pipeline {
            host_id: registration.host_id,
            rules: registration.rules,
            strategies: registration.strategies,
            chains: registration.chains,
        })
    }

    /// Run until `shutdown` is cancelled or a watcher fails to start.
    ///
    /// On the way out in-flight files are finished and seen-state is flushed.
    pub async fn start(self, shutdown: CancellationToken) -> Result<(), WatchError> {
        let pipeline = self.prepare()?;
        self.run(pipeline, shutdown).await
    }

    async fn run(self, pipeline: Pipeline, shutdown: CancellationToken) -> Result<(), WatchError> {
        let cfg = &self.settings.watchdog;
        let stop = shutdown.child_token();

        let (raw_tx, raw_rx) = mpsc::channel(cfg.raw_queue_capacity.max(1));
        let (debounced_tx, debounced_rx) = mpsc::channel(cfg.debounced_queue_capacity.max(1));
        let (batch_tx, batch_rx) = mpsc::channel(cfg.batch_queue_capacity.max(1));

        let mut debouncer = Debouncer::new(cfg.default_debounce());
        for rule in pipeline.rules.values() {
            debouncer.set_interval(&rule.business_id, rule.debounce_interval);
        }

        let native = NativeWatcher::new(cfg.liveness_interval())
            .with_channel_capacity(cfg.raw_queue_capacity);
        let poller = PollingWatcher::new(self.seen.clone(), cfg.poll_interval(), cfg.poll_workers);

        let mut tasks: JoinSet<Result<(), WatchError>> = JoinSet::new();

        for (biz, rule) in &pipeline.rules {
            for strategy in pipeline.strategies_for(biz) {
                let rule = rule.clone();
                let tx = raw_tx.clone();
                let stop = stop.clone();
                crate::log_event!("watchdog", "watching", "{biz} via {strategy}");
                match strategy {
                    WatchStrategy::Native => {
                        let native = native.clone();
                        tasks.spawn(async move { native.listen(rule, tx, stop).await });
                    }
                    WatchStrategy::Polling => {
                        let poller = poller.clone();
                        tasks.spawn(async move { poller.listen(rule, tx, stop).await });
                    }
                }
            }
        }
        drop(raw_tx);

        tasks.spawn(run_debouncer(raw_rx, debounced_tx, debouncer, stop.clone()));
        tasks.spawn(run_batch_collector(
            debounced_rx,
            batch_tx,
            cfg.batch_tick(),
            cfg.batch_max_size,
            stop.clone(),
        ));

        let dispatcher = Dispatcher::new(
            self.registry.clone(),
            pipeline.chains,
            self.seen.clone(),
            pipeline.host_id,
            cfg.workers,
        );
        {
            let stop = stop.clone();
            tasks.spawn(async move { dispatcher.run(batch_rx, stop).await });
        }

        crate::log_event!("watchdog", "started", "{} businesses", pipeline.rules.len());

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.unwrap_or_else(|e| {
                Err(WatchError::EventError {
                    details: format!("pipeline task panicked: {e}"),
                })
            });
            if let Err(e) = result {
                // downstream stages may exit first during shutdown
                if stop.is_cancelled() && matches!(e, WatchError::ChannelClosed) {
                    continue;
                }
                if first_error.is_none() {
                    tracing::error!("[watchdog] stopping: {e}");
                    first_error = Some(e);
                }
                stop.cancel();
            }
        }

        self.seen.flush()?;
        crate::log_event!("watchdog", "stopped", "{} paths in seen-state", self.seen.len());

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
