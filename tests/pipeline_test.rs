//! End-to-end runs of the watchdog: watcher, debouncer, batching and
//! dispatch wired together the way `bizwatch run` wires them.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bizwatch::config::Settings;
use bizwatch::watchdog::{
    AutoInit, FileRecord, Handler, HandlerError, HookError, Operation, Plugin, Registrar, Rule,
    SeenState, WatchStrategy, Watchdog,
};
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

type Calls = Arc<Mutex<Vec<(PathBuf, Operation)>>>;

struct RecordingSink {
    name: &'static str,
    priority: i32,
    fail: bool,
    calls: Calls,
}

#[async_trait]
impl Handler for RecordingSink {
    fn name(&self) -> &str {
        self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn handle(&self, record: &FileRecord) -> Result<(), HandlerError> {
        self.calls
            .lock()
            .push((record.absolute_path.clone(), record.originating_event.operation));
        if self.fail {
            return Err(HandlerError::Rejected {
                handler: self.name.to_string(),
                path: record.absolute_path.clone(),
                reason: "sink offline".to_string(),
            });
        }
        Ok(())
    }
}

/// Registers one rule and whatever sinks the test hands it.
struct TestPlugin {
    rule: Rule,
    strategies: Vec<WatchStrategy>,
    sinks: Vec<Arc<dyn Handler>>,
}

impl AutoInit for TestPlugin {
    fn auto_init(&self, registrar: &mut Registrar) -> Result<(), HookError> {
        registrar.set_rule(self.rule.clone());
        registrar.set_watch_strategy(&self.rule.business_id, &self.strategies);
        for sink in &self.sinks {
            registrar.add_handler(&self.rule.business_id, Arc::clone(sink));
        }
        Ok(())
    }
}

impl Plugin for TestPlugin {
    fn name(&self) -> &str {
        &self.rule.business_id
    }

    fn as_auto_init(&self) -> Option<&dyn AutoInit> {
        Some(self)
    }
}

fn fast_settings() -> Settings {
    let mut settings = Settings::default();
    settings.agent.hostname = "station-7".to_string();
    settings.watchdog.batch_tick_ms = 20;
    settings.watchdog.liveness_interval_secs = 1;
    settings.watchdog.workers = 2;
    settings
}

fn start(
    plugin: TestPlugin,
    seen: SeenState,
) -> (CancellationToken, tokio::task::JoinHandle<Result<(), bizwatch::WatchError>>) {
    let mut watchdog = Watchdog::new(Arc::new(fast_settings()), seen);
    watchdog.load_plugins([Arc::new(plugin) as Arc<dyn Plugin>]);

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(watchdog.start(shutdown.clone()));
    (shutdown, handle)
}

async fn wait_for(calls: &Calls, path: &Path) -> bool {
    for _ in 0..100 {
        if calls.lock().iter().any(|(p, _)| p == path) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_new_file_is_shipped_and_marked_seen() {
    let root = TempDir::new().unwrap();
    let seen = SeenState::temporary().unwrap();
    let calls: Calls = Arc::default();

    let rule = Rule::new("T1", root.path()).with_debounce(Duration::from_millis(50));
    let plugin = TestPlugin {
        rule,
        strategies: vec![WatchStrategy::Native],
        sinks: vec![Arc::new(RecordingSink {
            name: "console",
            priority: 0,
            fail: false,
            calls: Arc::clone(&calls),
        })],
    };
    let (shutdown, handle) = start(plugin, seen.clone());

    // let the watcher register the root
    tokio::time::sleep(Duration::from_millis(200)).await;
    let file = root.path().join("a.txt");
    std::fs::write(&file, "x").unwrap();

    assert!(wait_for(&calls, &file).await, "a.txt was never shipped");
    // several debounce and batch windows: nothing else may follow
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(*calls.lock(), vec![(file.clone(), Operation::Create)]);

    shutdown.cancel();
    handle.await.unwrap().unwrap();

    let entry = seen.get(&file).unwrap().expect("seen-state entry");
    let modified: chrono::DateTime<chrono::Utc> =
        std::fs::metadata(&file).unwrap().modified().unwrap().into();
    assert_eq!(entry.modified, modified);
    assert!(entry.checksum.is_some());
}

#[tokio::test]
async fn test_failing_sink_stops_chain_without_marking() {
    let root = TempDir::new().unwrap();
    let seen = SeenState::temporary().unwrap();
    let failing: Calls = Arc::default();
    let logging: Calls = Arc::default();

    let rule = Rule::new("T1", root.path()).with_debounce(Duration::from_millis(50));
    let plugin = TestPlugin {
        rule,
        strategies: vec![WatchStrategy::Native],
        sinks: vec![
            Arc::new(RecordingSink {
                name: "logging",
                priority: 1,
                fail: false,
                calls: Arc::clone(&logging),
            }),
            Arc::new(RecordingSink {
                name: "failing",
                priority: 2,
                fail: true,
                calls: Arc::clone(&failing),
            }),
        ],
    };
    let (shutdown, handle) = start(plugin, seen.clone());

    tokio::time::sleep(Duration::from_millis(200)).await;
    let file = root.path().join("a.txt");
    std::fs::write(&file, "hello").unwrap();

    assert!(wait_for(&failing, &file).await, "failing sink never ran");
    // give the dispatcher time to finish the task
    tokio::time::sleep(Duration::from_millis(200)).await;

    shutdown.cancel();
    handle.await.unwrap().unwrap();

    assert!(logging.lock().is_empty(), "lower-priority sink must not run");
    assert!(seen.get(&file).unwrap().is_none());
}

#[tokio::test]
async fn test_polling_backfill_ships_existing_files_once() {
    let root = TempDir::new().unwrap();
    std::fs::create_dir_all(root.path().join("2024/01")).unwrap();
    let old = root.path().join("2024/01/old.csv");
    std::fs::write(&old, "1,2,3").unwrap();

    let seen = SeenState::temporary().unwrap();
    let calls: Calls = Arc::default();

    let rule = Rule::new("T1", root.path()).with_debounce(Duration::from_millis(50));
    let sink: Arc<dyn Handler> = Arc::new(RecordingSink {
        name: "console",
        priority: 0,
        fail: false,
        calls: Arc::clone(&calls),
    });

    let plugin = TestPlugin {
        rule: rule.clone(),
        strategies: vec![WatchStrategy::Polling],
        sinks: vec![Arc::clone(&sink)],
    };
    let (shutdown, handle) = start(plugin, seen.clone());
    assert!(wait_for(&calls, &old).await, "backfill never shipped old.csv");
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    // a second agent over the same store has nothing left to ship
    let plugin = TestPlugin {
        rule,
        strategies: vec![WatchStrategy::Polling],
        sinks: vec![sink],
    };
    let (shutdown, handle) = start(plugin, seen.clone());
    tokio::time::sleep(Duration::from_millis(500)).await;
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(calls.lock().iter().filter(|(p, _)| *p == old).count(), 1);
}

#[tokio::test]
async fn test_missing_root_fails_startup() {
    let root = TempDir::new().unwrap();
    let plugin = TestPlugin {
        rule: Rule::new("T1", root.path().join("not-there")),
        strategies: vec![WatchStrategy::Native],
        sinks: Vec::new(),
    };

    let mut watchdog = Watchdog::new(Arc::new(fast_settings()), SeenState::temporary().unwrap());
    watchdog.load_plugins([Arc::new(plugin) as Arc<dyn Plugin>]);

    let err = watchdog.start(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, bizwatch::WatchError::RootUnreachable { .. }));
}

#[tokio::test]
async fn test_zero_batch_tick_fails_startup_instead_of_panicking() {
    let root = TempDir::new().unwrap();
    let plugin = TestPlugin {
        rule: Rule::new("T1", root.path()),
        strategies: vec![WatchStrategy::Native],
        sinks: Vec::new(),
    };

    let mut settings = fast_settings();
    settings.watchdog.batch_tick_ms = 0;
    let mut watchdog = Watchdog::new(Arc::new(settings), SeenState::temporary().unwrap());
    watchdog.load_plugins([Arc::new(plugin) as Arc<dyn Plugin>]);

    let err = watchdog.start(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, bizwatch::WatchError::InitFailed { .. }));
    assert!(err.to_string().contains("batch_tick_ms"));
}
