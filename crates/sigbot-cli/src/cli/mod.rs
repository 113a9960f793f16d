//! CLI command definitions for the `sigbot` binary.
//!
//! Uses clap derive macros. Commands follow a noun-verb pattern
//! (`sigbot dlq inspect`, `sigbot config show`) with `run` at the top level.

pub mod config;
pub mod dlq;
pub mod run;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Run and operate a Signal bot.
#[derive(Parser)]
#[command(name = "sigbot", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Config file (defaults to ./sigbot.toml).
    #[arg(short, long, global = true, env = "SIGBOT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Export spans and metrics through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Connect to the gateway and process messages until interrupted.
    Run {
        /// Seconds between metrics exports when --otel is set.
        #[arg(long, default_value = "60")]
        metrics_interval: u64,
    },

    /// Inspect or replay the dead-letter queue.
    Dlq {
        #[command(subcommand)]
        action: DlqCommand,
    },

    /// Show the effective configuration.
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
}

#[derive(Subcommand)]
pub enum DlqCommand {
    /// List stored dead letters.
    Inspect,

    /// Move due dead letters into the durable ingest queue for the next run.
    Replay,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Print the configuration after file and environment overrides.
    Show,
}
