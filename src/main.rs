use clap::Parser;

use bizwatch::cli::commands;
use bizwatch::cli::{Cli, Commands, StateAction};
use bizwatch::config::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.config.as_deref();

    // init must work before any config exists
    if let Commands::Init { force } = cli.command {
        bizwatch::logging::init();
        return commands::init::run_init(config, force);
    }

    let settings = Settings::load(config)?;
    bizwatch::logging::init_with_config(&settings.logging);

    match cli.command {
        Commands::Run => commands::run::run(settings).await,
        Commands::Check => commands::check::run_check(settings),
        Commands::State { action } => match action {
            StateAction::Get { path } => commands::state::run_get(&settings, &path),
            StateAction::Forget { path } => commands::state::run_forget(&settings, &path),
            StateAction::Count => commands::state::run_count(&settings),
        },
        Commands::Init { .. } => Ok(()),
    }
}
