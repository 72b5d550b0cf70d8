//! Error types for the watchdog pipeline.

use std::path::PathBuf;
use thiserror::Error;

use super::hook::Hook;

/// Errors from watcher setup and the event pipeline.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Failed to initialize watcher: {reason}")]
    InitFailed { reason: String },

    #[error("Watch root {path} is not reachable: {reason}")]
    RootUnreachable { path: PathBuf, reason: String },

    #[error("Cannot watch path {path}: {reason}")]
    PathWatchFailed { path: PathBuf, reason: String },

    #[error("File system event error: {details}")]
    EventError { details: String },

    #[error("Invalid rule for business '{biz}': {reason}")]
    InvalidRule { biz: String, reason: String },

    #[error("Seen-state error: {0}")]
    State(#[from] StateError),

    #[error("Hook failed: {0}")]
    Hook(#[from] HookError),

    #[error("Channel closed unexpectedly")]
    ChannelClosed,
}

impl From<notify::Error> for WatchError {
    fn from(e: notify::Error) -> Self {
        WatchError::InitFailed {
            reason: e.to_string(),
        }
    }
}

/// Errors returned by output sinks.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Sink '{handler}' rejected {path}: {reason}")]
    Rejected {
        handler: String,
        path: PathBuf,
        reason: String,
    },

    #[error("{0}")]
    Other(String),
}

/// A plugin hook returned an error.
#[derive(Error, Debug)]
#[error("{hook} hook of plugin '{plugin}' failed: {reason}")]
pub struct HookError {
    pub plugin: String,
    pub hook: Hook,
    pub reason: String,
}

impl HookError {
    pub fn new(plugin: impl Into<String>, hook: Hook, reason: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            hook,
            reason: reason.into(),
        }
    }
}

/// Errors from the persisted seen-state store.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("Failed to open seen-state at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: sled::Error,
    },

    #[error("Seen-state storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("Corrupt seen-state entry for {key}: {reason}")]
    Corrupt { key: String, reason: String },
}
