//! Agent logging.
//!
//! The agent runs unattended, so the log is the operator's only record of
//! files that failed a sink and are waiting for the next poll. Every line
//! emitted while a file is being dispatched carries a `file` span with the
//! business id, path and operation.
//!
//! ```text
//! 2024-05-02T14:03:11.207  INFO file{biz=T1 path=/data/t1/a.txt op=CREATE}: [dispatcher] shipped: ...
//! ```
//!
//! Logs go to stderr; stdout belongs to command output.
//!
//! # Configuration
//!
//! ```toml
//! [logging]
//! default = "info"
//!
//! [logging.modules]
//! dispatcher = "debug"          # short for bizwatch::watchdog::dispatcher
//! bsi = "trace"                 # short for bizwatch::plugins::bsi
//! "notify" = "debug"            # any other target is taken verbatim
//! ```
//!
//! `RUST_LOG` replaces the whole filter when set.

use std::io::IsTerminal;
use std::path::Path;
use std::sync::Once;

use tracing::Span;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LoggingConfig;
use crate::watchdog::Operation;

static INIT: Once = Once::new();

/// Pipeline stages addressable by their bare name in `[logging.modules]`.
const WATCHDOG_MODULES: &[&str] = &[
    "batch",
    "debouncer",
    "dispatcher",
    "handlers",
    "hook",
    "native",
    "polling",
    "record",
    "runtime",
    "seen_state",
];

const PLUGIN_MODULES: &[&str] = &["default", "bsi"];

/// Dependencies that are chatty at debug level; kept at warn unless a
/// module entry says otherwise.
const QUIET_DEPENDENCIES: &[&str] = &["sled", "notify", "ignore", "globset"];

/// Date and millisecond time; agents run for weeks.
struct AgentTime;

impl FormatTime for AgentTime {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"))
    }
}

/// Expand a `[logging.modules]` key to a tracing target.
pub fn resolve_target(name: &str) -> String {
    if name.contains("::") {
        name.to_string()
    } else if WATCHDOG_MODULES.contains(&name) {
        format!("bizwatch::watchdog::{name}")
    } else if PLUGIN_MODULES.contains(&name) {
        format!("bizwatch::plugins::{name}")
    } else if name == "watchdog" || name == "plugins" || name == "cli" {
        format!("bizwatch::{name}")
    } else {
        name.to_string()
    }
}

/// Filter string built from config: default level, quiet dependencies,
/// then the configured modules (later directives win for equal targets).
pub fn filter_directives(config: &LoggingConfig) -> String {
    let mut directives = vec![config.default.clone()];
    for dep in QUIET_DEPENDENCIES {
        if !config.modules.contains_key(*dep) {
            directives.push(format!("{dep}=warn"));
        }
    }

    let mut modules: Vec<_> = config.modules.iter().collect();
    modules.sort();
    for (module, level) in modules {
        directives.push(format!("{}={level}", resolve_target(module)));
    }
    directives.join(",")
}

/// Install the global subscriber. Only the first call takes effect.
pub fn init_with_config(config: &LoggingConfig) {
    INIT.call_once(|| {
        let filter = match std::env::var("RUST_LOG") {
            Ok(_) => EnvFilter::from_default_env(),
            Err(_) => EnvFilter::new(filter_directives(config)),
        };

        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(std::io::stderr().is_terminal())
            .with_target(false)
            .with_timer(AgentTime)
            .with_filter(filter);

        tracing_subscriber::registry().with(stderr_layer).init();
    });
}

/// Install the subscriber with the default `info` level.
pub fn init() {
    init_with_config(&LoggingConfig::default());
}

/// Span wrapping one file's trip through the dispatcher.
pub fn file_span(business_id: &str, path: &Path, operation: Operation) -> Span {
    tracing::info_span!(
        "file",
        biz = %business_id,
        path = %path.display(),
        op = %operation
    )
}

/// Log a pipeline event at info level as `[component] event: detail`.
///
/// ```ignore
/// log_event!("polling", "backfill", "{}: {count} files", rule.business_id);
/// log_event!("agent", "stopped");
/// ```
#[macro_export]
macro_rules! log_event {
    ($component:expr, $event:expr) => {
        tracing::info!("[{}] {}", $component, $event)
    };
    ($component:expr, $event:expr, $($arg:tt)*) => {
        tracing::info!("[{}] {}: {}", $component, $event, format!($($arg)*))
    };
}

/// Same as [`log_event!`] at debug level.
#[macro_export]
macro_rules! debug_event {
    ($component:expr, $event:expr) => {
        tracing::debug!("[{}] {}", $component, $event)
    };
    ($component:expr, $event:expr, $($arg:tt)*) => {
        tracing::debug!("[{}] {}: {}", $component, $event, format!($($arg)*))
    };
}
