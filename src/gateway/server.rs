//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::join_all;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::router::{AppState, create_router};
use crate::backend::Backends;
use crate::cache::ResponseCache;
use crate::config::Config;
use crate::failsafe::Failsafe;
use crate::resolver::{QueryResolver, RerankCache};
use crate::rollout::{RolloutController, build_controller};
use crate::telemetry::{LatencySample, MetricAggregator};
use crate::{Error, Result};

/// Rerank gateway server
pub struct Gateway {
    /// Configuration
    config: Config,
    /// Result cache
    cache: Arc<RerankCache>,
    /// Query resolver
    resolver: Arc<QueryResolver>,
    /// Latency aggregator
    aggregator: Arc<MetricAggregator>,
    /// Receiving end of the sample stream, taken by `run`
    samples: Option<tokio::sync::mpsc::Receiver<LatencySample>>,
    /// Rollout controller, when configured
    rollout: Option<Arc<RolloutController>>,
}

impl Gateway {
    /// Wire the service objects described by `config`
    pub fn new(config: Config) -> Result<Self> {
        let backends = Backends::from_config(&config.backends)?;
        let cache: Arc<RerankCache> = Arc::new(ResponseCache::new(
            config.cache.max_entries,
            config.cache.stale_retention,
        ));
        let (aggregator, sink, samples) = MetricAggregator::new(&config.telemetry);
        let resolver = Arc::new(QueryResolver::new(
            backends,
            Arc::clone(&cache),
            config.cache.clone(),
            Failsafe::new("rerank", &config.failsafe),
            sink,
            &config.resolver,
            config.failsafe.retry.budget,
        )
        .with_search_retry(&config.backends.search.retry));

        let rollout = config
            .rollout
            .as_ref()
            .map(|r| build_controller(r, Arc::clone(&aggregator)).map(Arc::new))
            .transpose()?;

        Ok(Self {
            config,
            cache,
            resolver,
            aggregator,
            samples: Some(samples),
            rollout,
        })
    }

    /// Run the gateway until a shutdown signal
    pub async fn run(mut self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let (shutdown_tx, _) = broadcast::channel(1);
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        // Metric aggregation
        let samples = self
            .samples
            .take()
            .ok_or_else(|| Error::Internal("gateway already started".to_string()))?;
        tasks.push(tokio::spawn(
            Arc::clone(&self.aggregator).run(samples, shutdown_tx.subscribe()),
        ));

        // Cache sweeper
        if self.config.cache.enabled {
            let cache = Arc::clone(&self.cache);
            let sweep_interval = self.config.cache.sweep_interval;
            let mut shutdown_rx = shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(sweep_interval);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            let evicted = cache.evict_expired();
                            if evicted > 0 {
                                debug!(evicted, remaining = cache.len(), "Cache sweep");
                            }
                        }
                        _ = shutdown_rx.recv() => break,
                    }
                }
            }));
        }

        // Rollout control loop
        if let Some(controller) = &self.rollout {
            let controller = Arc::clone(controller);
            let shutdown_rx = shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                match controller.run(shutdown_rx).await {
                    Ok(report) => match report.outcome() {
                        Ok(()) => info!(release = %report.release, "Rollout promoted"),
                        Err(e) => warn!(release = %report.release, error = %e, "Rollout rolled back"),
                    },
                    Err(Error::Shutdown) => {}
                    Err(e) => error!(error = %e, "Rollout aborted"),
                }
            }));
        }

        #[cfg(feature = "metrics")]
        let metrics = match crate::telemetry::exporter::install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "Prometheus exporter disabled");
                None
            }
        };

        let state = Arc::new(AppState {
            resolver: Arc::clone(&self.resolver),
            aggregator: Arc::clone(&self.aggregator),
            rollout: self.rollout.clone(),
            #[cfg(feature = "metrics")]
            metrics,
            route: self.config.resolver.route.clone(),
            request_timeout: self.config.server.request_timeout,
        });
        let app = create_router(
            state,
            &self.config.server.cors_origins,
            self.config.server.max_body_size,
        );

        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("RERANK GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        info!(
            "  POST http://{}:{}{}  (queries)",
            self.config.server.host, self.config.server.port, self.config.resolver.route
        );
        info!(
            threshold = self.config.failsafe.circuit_breaker.failure_threshold,
            cooldown = ?self.config.failsafe.circuit_breaker.cooldown,
            "Rerank circuit breaker"
        );
        if let Some(rollout) = &self.config.rollout {
            info!(
                release = %rollout.release,
                stages = ?rollout.stages,
                metric = %rollout.metric.name(),
                "Rollout enabled (GET /rollout)"
            );
        }

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx.clone()))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        // Background tasks may still be running if the server stopped on its own
        let _ = shutdown_tx.send(());
        info!("Waiting for background tasks...");
        if tokio::time::timeout(self.config.server.shutdown_timeout, join_all(tasks))
            .await
            .is_err()
        {
            warn!(timeout = ?self.config.server.shutdown_timeout, "Background tasks did not stop in time");
        }

        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
