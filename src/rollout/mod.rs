//! Metric-gated canary rollouts

pub mod control_plane;
pub mod controller;
pub mod notifier;
pub mod source;

use std::sync::Arc;

pub use control_plane::{DeploymentControlPlane, HttpControlPlane, LoggingControlPlane, PlaneCommand};
pub use controller::{AnalysisRun, RolloutController, RolloutSnapshot, StageRecord};
pub use notifier::{LogNotifier, RollbackNotice, RolloutNotifier, WebhookNotifier};
pub use source::{InProcessSource, MetricSource, PrometheusSource};

use crate::Result;
use crate::config::RolloutConfig;
use crate::telemetry::MetricAggregator;

/// Wire a controller from configuration
///
/// The in-process source reads `aggregator`; HTTP bindings use
/// `analysis_timeout` as their client timeout.
pub fn build_controller(
    config: &RolloutConfig,
    aggregator: Arc<MetricAggregator>,
) -> Result<RolloutController> {
    let timeout = config.analysis_timeout;
    RolloutController::new(
        config.clone(),
        source::from_config(&config.source, aggregator, timeout)?,
        control_plane::from_config(&config.release, &config.control_plane, timeout)?,
        notifier::from_config(config.notify_webhook.as_deref(), timeout)?,
    )
}
