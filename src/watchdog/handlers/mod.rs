//! Built-in sinks.

mod backup;
mod console;

pub use backup::LocalBackupHandler;
pub use console::ConsoleHandler;
