pub mod cli;
pub mod config;
pub mod logging;
pub mod plugins;
pub mod watchdog;

pub use config::{BizConfig, ConfigError, Settings};
pub use watchdog::{
    ChangeEvent, FileRecord, Handler, HandlerChain, HookRegistry, Operation, Plugin, Rule,
    SeenState, WatchError, WatchStrategy, Watchdog,
};
