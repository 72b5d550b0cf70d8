//! Configuration for the ingestion agent.
//!
//! Layered the usual way:
//! - Default values
//! - TOML configuration file
//! - Environment variable overrides
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `BIZWATCH_` and use double
//! underscores to separate nested levels:
//! - `BIZWATCH_AGENT__HOSTNAME=station-7` sets `agent.hostname`
//! - `BIZWATCH_WATCHDOG__WORKERS=2` sets `watchdog.workers`
//! - `BIZWATCH_BIZ__BSI__DEBOUNCE_MS=500` sets `biz.bsi.debounce_ms`
//!
//! The file itself is found via `--config`, then `BIZWATCH_CONFIG`, then
//! `./conf/bizwatch.toml`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::watchdog::{Rule, WatchError, WatchStrategy};

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "BIZWATCH_CONFIG";

/// Used when neither `--config` nor `BIZWATCH_CONFIG` is given.
pub const DEFAULT_CONFIG_PATH: &str = "conf/bizwatch.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Business '{biz}' has no watch path configured")]
    MissingWatch { biz: String },

    #[error("Agent is disabled (agent.enabled = false)")]
    AgentDisabled,

    #[error("Invalid hostname '{hostname}': set agent.hostname to this machine's name")]
    InvalidHostname { hostname: String },

    #[error("Business '{biz}' uses unknown plugin '{plugin}'")]
    UnknownPlugin { biz: String, plugin: String },

    #[error("Invalid rule for business '{biz}': {reason}")]
    InvalidRule { biz: String, reason: String },

    #[error("Invalid setting watchdog.{key}: {reason}")]
    InvalidSetting { key: &'static str, reason: String },

    #[error("Configuration file already exists at {path}. Use --force to overwrite")]
    AlreadyExists { path: PathBuf },

    #[error("Failed to write configuration to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub watchdog: WatchdogConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// One section per business stream, keyed by business id.
    #[serde(default)]
    pub biz: BTreeMap<String, BizConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AgentConfig {
    /// Stamped on every shipped record. `localhost` is rejected.
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Master switch; a disabled agent refuses to start.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Directory holding the seen-state database.
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WatchdogConfig {
    /// Interval between full backfill walks.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Directory-walk threads used by one poll.
    #[serde(default = "default_poll_workers")]
    pub poll_workers: usize,

    /// How often a degraded native watcher probes its root.
    #[serde(default = "default_liveness_interval_secs")]
    pub liveness_interval_secs: u64,

    #[serde(default = "default_batch_tick_ms")]
    pub batch_tick_ms: u64,

    #[serde(default = "default_batch_max_size")]
    pub batch_max_size: usize,

    #[serde(default = "default_queue_capacity")]
    pub raw_queue_capacity: usize,

    #[serde(default = "default_queue_capacity")]
    pub debounced_queue_capacity: usize,

    #[serde(default = "default_batch_queue_capacity")]
    pub batch_queue_capacity: usize,

    /// Concurrent per-file tasks.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Debounce used by businesses that don't set their own.
    #[serde(default = "default_debounce_ms")]
    pub default_debounce_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Default log level: "error", "warn", "info", "debug", "trace".
    #[serde(default = "default_log_level")]
    pub default: String,

    /// Per-module overrides, e.g. `dispatcher = "debug"`.
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BizConfig {
    /// Factory key selecting the plugin implementation.
    #[serde(default = "default_plugin")]
    pub plugin: String,

    /// Root of the business tree.
    #[serde(default)]
    pub watch: Option<PathBuf>,

    /// Sub-path below `watch` that is actually monitored.
    #[serde(default)]
    pub subdir: String,

    /// Include regex, matched against `/`-separated file paths.
    #[serde(default)]
    pub patterns: String,

    /// Exclude regex, applied to files and directories.
    #[serde(default)]
    pub ignores: String,

    /// Native watcher recursion limit, 0 = unlimited.
    #[serde(default)]
    pub max_nesting_level: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debounce_ms: Option<u64>,

    /// Run the polling backfill.
    #[serde(default = "default_true")]
    pub history_import: bool,

    /// Run the native watcher.
    #[serde(default = "default_true")]
    pub realtime: bool,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Local mirror destination; attaches the backup sink when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<PathBuf>,

    #[serde(default = "default_true")]
    pub console: bool,

    #[serde(default)]
    pub console_priority: i32,

    #[serde(default = "default_backup_priority")]
    pub backup_priority: i32,
}

fn default_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_default()
}
fn default_true() -> bool {
    true
}
fn default_state_path() -> PathBuf {
    PathBuf::from(".bizwatch/state")
}
fn default_poll_interval_secs() -> u64 {
    30 * 60
}
fn default_poll_workers() -> usize {
    4
}
fn default_liveness_interval_secs() -> u64 {
    20
}
fn default_batch_tick_ms() -> u64 {
    500
}
fn default_batch_max_size() -> usize {
    100
}
fn default_queue_capacity() -> usize {
    100
}
fn default_batch_queue_capacity() -> usize {
    1
}
fn default_workers() -> usize {
    num_cpus::get()
}
fn default_debounce_ms() -> u64 {
    3000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_plugin() -> String {
    "default".to_string()
}
fn default_backup_priority() -> i32 {
    10
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            enabled: true,
            state_path: default_state_path(),
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            poll_workers: default_poll_workers(),
            liveness_interval_secs: default_liveness_interval_secs(),
            batch_tick_ms: default_batch_tick_ms(),
            batch_max_size: default_batch_max_size(),
            raw_queue_capacity: default_queue_capacity(),
            debounced_queue_capacity: default_queue_capacity(),
            batch_queue_capacity: default_batch_queue_capacity(),
            workers: default_workers(),
            default_debounce_ms: default_debounce_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
            modules: HashMap::new(),
        }
    }
}

impl Default for BizConfig {
    fn default() -> Self {
        Self {
            plugin: default_plugin(),
            watch: None,
            subdir: String::new(),
            patterns: String::new(),
            ignores: String::new(),
            max_nesting_level: 0,
            debounce_ms: None,
            history_import: true,
            realtime: true,
            enabled: true,
            backup: None,
            console: true,
            console_priority: 0,
            backup_priority: default_backup_priority(),
        }
    }
}

impl WatchdogConfig {
    /// Intervals and sizes that drive timers must be positive.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("poll_interval_secs", self.poll_interval_secs),
            ("liveness_interval_secs", self.liveness_interval_secs),
            ("batch_tick_ms", self.batch_tick_ms),
            ("batch_max_size", self.batch_max_size as u64),
        ];
        match positive.into_iter().find(|(_, value)| *value == 0) {
            Some((key, _)) => Err(ConfigError::InvalidSetting {
                key,
                reason: "must be greater than zero".to_string(),
            }),
            None => Ok(()),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs)
    }

    pub fn batch_tick(&self) -> Duration {
        Duration::from_millis(self.batch_tick_ms)
    }

    pub fn default_debounce(&self) -> Duration {
        Duration::from_millis(self.default_debounce_ms)
    }
}

impl BizConfig {
    /// Build the immutable watch rule for business `name`.
    pub fn to_rule(&self, name: &str, default_debounce: Duration) -> Result<Rule, ConfigError> {
        let root = self.watch.as_ref().ok_or_else(|| ConfigError::MissingWatch {
            biz: name.to_string(),
        })?;

        let debounce = self
            .debounce_ms
            .map(Duration::from_millis)
            .unwrap_or(default_debounce);

        let rule = Rule::new(name, root)
            .with_sub_path(self.subdir.trim_matches('/'))
            .with_max_depth(self.max_nesting_level)
            .with_debounce(debounce)
            .with_include(&self.patterns)
            .and_then(|rule| rule.with_exclude(&self.ignores))
            .map_err(|e| match e {
                WatchError::InvalidRule { biz, reason } => ConfigError::InvalidRule { biz, reason },
                other => ConfigError::InvalidRule {
                    biz: name.to_string(),
                    reason: other.to_string(),
                },
            })?;

        Ok(rule)
    }

    /// Watch mechanisms enabled for this business.
    pub fn strategies(&self) -> Vec<WatchStrategy> {
        let mut strategies = Vec::with_capacity(2);
        if self.realtime {
            strategies.push(WatchStrategy::Native);
        }
        if self.history_import {
            strategies.push(WatchStrategy::Polling);
        }
        strategies
    }
}

impl Settings {
    /// Resolve the config file path: explicit, then env, then default.
    pub fn config_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.is_empty() => PathBuf::from(path),
            _ => PathBuf::from(DEFAULT_CONFIG_PATH),
        }
    }

    /// Load configuration from all sources.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_from(Self::config_path(explicit))
    }

    /// Load configuration from a specific file (missing file = defaults).
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            // Double underscore (__) separates nested levels
            .merge(Env::prefixed("BIZWATCH_").map(|key| {
                key.as_str().to_lowercase().replace("__", ".").into()
            }))
            .extract()
            .map_err(|e| ConfigError::Load(Box::new(e)))
    }

    /// Everything `run` and `check` require before touching the filesystem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_agent()?;
        self.watchdog.validate()
    }

    /// Refuse to run on a disabled agent or an unidentifiable host.
    pub fn validate_agent(&self) -> Result<(), ConfigError> {
        if !self.agent.enabled {
            return Err(ConfigError::AgentDisabled);
        }
        let host = self.agent.hostname.trim();
        if host.is_empty() || host.eq_ignore_ascii_case("localhost") {
            return Err(ConfigError::InvalidHostname {
                hostname: self.agent.hostname.clone(),
            });
        }
        Ok(())
    }

    /// Write a commented default configuration file.
    pub fn init_config_file(path: &Path, force: bool) -> Result<PathBuf, ConfigError> {
        if !force && path.exists() {
            return Err(ConfigError::AlreadyExists {
                path: path.to_path_buf(),
            });
        }

        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }

        let hostname = match default_hostname() {
            h if h.is_empty() => "CHANGE-ME".to_string(),
            h => h,
        };
        let content = DEFAULT_CONFIG_TEMPLATE.replace("{hostname}", &hostname);
        std::fs::write(path, content).map_err(write_err)?;

        Ok(path.to_path_buf())
    }
}

const DEFAULT_CONFIG_TEMPLATE: &str = r#"# bizwatch configuration
#
# Every key can be overridden with BIZWATCH_<SECTION>__<KEY>, e.g.
#   BIZWATCH_AGENT__HOSTNAME=station-7

[agent]
# Stamped on every shipped file. Must not be "localhost".
hostname = "{hostname}"
enabled = true
state_path = ".bizwatch/state"

[watchdog]
poll_interval_secs = 1800
poll_workers = 4
liveness_interval_secs = 20
batch_tick_ms = 500
batch_max_size = 100
default_debounce_ms = 3000
# workers = 8          # defaults to the number of CPUs

[logging]
default = "info"

[logging.modules]
# dispatcher = "debug"

# One section per business stream.
#
# [biz.example]
# plugin = "default"          # or "bsi"
# watch = "/data/example"
# subdir = ""
# patterns = '\.(csv|log)$'   # include regex, files only
# ignores = '/tmp/'           # exclude regex, files and directories
# max_nesting_level = 0       # 0 = unlimited
# debounce_ms = 3000
# history_import = true       # polling backfill
# realtime = true             # native watcher
# backup = "/backup/example"
# console = true
"#;
