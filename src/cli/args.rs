//! CLI argument parsing using clap.

use clap::{
    Parser, Subcommand,
    builder::styling::{AnsiColor, Effects, Styles},
};
use std::path::PathBuf;

fn clap_cargo_style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Unattended file-ingestion agent
#[derive(Parser)]
#[command(name = "bizwatch", version, styles = clap_cargo_style())]
#[command(
    about = "Watch business directories and ship new files through their sink chains",
    after_help = "Config file: --config, then $BIZWATCH_CONFIG, then ./conf/bizwatch.toml"
)]
pub struct Cli {
    /// Path to a custom bizwatch.toml
    #[arg(short, long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Start the agent and run until Ctrl-C
    Run,

    /// Load plugins, run the startup hooks and print what would be watched
    Check,

    /// Write a default configuration file
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Inspect or edit the seen-state store
    State {
        #[command(subcommand)]
        action: StateAction,
    },
}

#[derive(Subcommand)]
pub enum StateAction {
    /// Show the stored entry for a file
    Get {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },

    /// Drop a file's entry so it ships again on the next poll
    Forget {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },

    /// Number of tracked files
    Count,
}
