//! sigbot entry point.
//!
//! Binary name: `sigbot`
//!
//! Parses CLI arguments, sets up tracing, then dispatches to the command
//! handler. `run` keeps going until Ctrl+C or SIGTERM.

mod cli;
mod state;

use std::time::Duration;

use clap::Parser;
use sigbot_observe::tracing_setup::{TracingOptions, init_tracing, shutdown_tracing};

use cli::{Cli, Commands, ConfigCommand, DlqCommand};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let tracing_options = TracingOptions {
        json: cli.json_logs,
        enable_otel: cli.otel,
        ..TracingOptions::default()
    }
    .with_verbosity(cli.verbose, cli.quiet);
    init_tracing(&tracing_options).map_err(|e| anyhow::anyhow!("initializing tracing: {e}"))?;

    let outcome = dispatch(cli).await;
    shutdown_tracing();
    outcome
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Run { metrics_interval } => {
            let state = AppState::init(config_path).await?;
            cli::run::run(
                state,
                cli::run::RunOptions {
                    export_metrics: cli.otel,
                    metrics_interval: Duration::from_secs(metrics_interval),
                },
            )
            .await?;
        }

        Commands::Dlq { action } => {
            let state = AppState::init(config_path).await?;
            match action {
                DlqCommand::Inspect => cli::dlq::inspect(&state, cli.json).await?,
                DlqCommand::Replay => cli::dlq::replay(&state, cli.json).await?,
            }
        }

        Commands::Config { action } => match action {
            ConfigCommand::Show => cli::config::show(config_path, cli.json).await?,
        },
    }

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
