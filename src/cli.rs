//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Rerank query gateway with circuit breaking and metric-gated canary rollouts
#[derive(Parser, Debug)]
#[command(name = "rerank-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "RERANK_GATEWAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "RERANK_GATEWAY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "RERANK_GATEWAY_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "RERANK_GATEWAY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "RERANK_GATEWAY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default)
    Serve,

    /// Drive one canary rollout to completion and exit
    ///
    /// Exits 0 when the release is promoted, 1 when it is rolled back or the
    /// rollout could not run.
    Rollout {
        /// Override the release identifier from the config
        #[arg(long)]
        release: Option<String>,

        /// Print the final report as JSON
        #[arg(long)]
        json: bool,
    },
}
