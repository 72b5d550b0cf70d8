//! Run command: the long-lived agent.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::plugins;
use crate::watchdog::Watchdog;

use super::open_seen_state;

pub async fn run(settings: Settings) -> anyhow::Result<()> {
    settings.validate()?;
    let seen = open_seen_state(&settings)?;
    let settings = Arc::new(settings);

    let mut watchdog = Watchdog::new(Arc::clone(&settings), seen);
    let plugins = plugins::autoload(&settings)?;
    let loaded = watchdog.load_plugins(plugins);
    crate::log_event!(
        "agent",
        "starting",
        "host {} with {loaded} plugins",
        settings.agent.hostname
    );

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        let signal = shutdown_signal().await;
        crate::log_event!("agent", signal, "finishing in-flight files");
        signal_token.cancel();
    });

    watchdog
        .start(shutdown)
        .await
        .context("watchdog stopped with an error")?;

    crate::log_event!("agent", "stopped");
    Ok(())
}

/// Resolves on Ctrl-C, or on SIGTERM from a service supervisor.
async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("[agent] cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!("[agent] cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "interrupt",
        _ = terminate => "terminated",
    }
}
