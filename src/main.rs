//! Rerank Gateway - resilient vector search + rerank with canary rollouts

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use rerank_gateway::{
    cli::{Cli, Command},
    config::{Config, MetricSourceConfig},
    gateway::Gateway,
    rollout::build_controller,
    setup_tracing,
    telemetry::MetricAggregator,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::Rollout { release, json }) => run_rollout(config, release, json).await,
        Some(Command::Serve) | None => run_server(config).await,
    }
}

/// Drive one rollout and report the outcome through the exit code
async fn run_rollout(config: Config, release: Option<String>, json: bool) -> ExitCode {
    let Some(mut rollout) = config.rollout.clone() else {
        error!("No rollout section in the configuration");
        return ExitCode::FAILURE;
    };
    if let Some(release) = release {
        rollout.release = release;
    }
    if rollout.source == MetricSourceConfig::InProcess {
        warn!("In-process metric source only sees this process's traffic; configure a prometheus source for standalone rollouts");
    }

    let (aggregator, _sink, _samples) = MetricAggregator::new(&config.telemetry);
    let controller = match build_controller(&rollout, aggregator) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("Failed to create rollout controller: {e}");
            return ExitCode::FAILURE;
        }
    };

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, pausing rollout");
            let _ = shutdown_tx.send(());
        }
    });

    let report = match controller.run(shutdown_rx).await {
        Ok(report) => report,
        Err(e) => {
            error!("Rollout failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    if json {
        match serde_json::to_string_pretty(&report) {
            Ok(text) => println!("{text}"),
            Err(e) => error!("Failed to serialize report: {e}"),
        }
    } else {
        println!("Release {}: {}", report.release, report.status);
        for run in &report.analyses {
            println!(
                "  stage {} ({}): {} = {:?}, threshold {} -> {}",
                run.stage,
                report
                    .stages
                    .iter()
                    .rev()
                    .find(|s| s.stage == run.stage)
                    .map_or(0, |s| s.weight),
                report.metric,
                run.metric_value,
                run.threshold,
                run.verdict
            );
        }
    }

    match report.outcome() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Run the gateway server
async fn run_server(config: Config) -> ExitCode {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        rollout = config.rollout.is_some(),
        "Starting Rerank Gateway"
    );

    let gateway = match Gateway::new(config) {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}
