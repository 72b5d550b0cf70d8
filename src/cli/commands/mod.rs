//! Command implementations for the CLI.

pub mod check;
pub mod init;
pub mod run;
pub mod state;

use std::path::Path;

use anyhow::Context;

use crate::config::Settings;
use crate::watchdog::SeenState;

/// Open the seen-state store configured in `settings`.
pub(crate) fn open_seen_state(settings: &Settings) -> anyhow::Result<SeenState> {
    let dir: &Path = &settings.agent.state_path;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating state directory {}", dir.display()))?;
    Ok(SeenState::open(dir)?)
}
