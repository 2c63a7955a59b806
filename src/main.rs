//! fixture-dock - main entry point.

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use fixture_dock::cli::{
    Cli, Command, run_build_command, run_doctor_command, run_list_command, run_up_command,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before clap reads env-backed arguments
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fixture_dock=info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    match cli.command {
        Command::List => run_list_command(cli.definitions),
        Command::Build { fixture } => run_build_command(&fixture, cli.definitions).await,
        Command::Up { fixture, json } => run_up_command(&fixture, json, cli.definitions).await,
        Command::Doctor => run_doctor_command(cli.definitions).await,
    }
}
