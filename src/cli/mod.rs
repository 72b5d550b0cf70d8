//! Command-line interface.
//!
//! Argument parsing lives in [`args`]; each subcommand has its own module
//! under [`commands`].

pub mod args;
pub mod commands;

pub use args::{Cli, Commands, StateAction};
