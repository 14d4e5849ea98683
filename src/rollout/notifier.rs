//! Operator notification on rollback

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gateway_core::RollbackReason;
use reqwest::Client;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::Result;
use crate::backend::http::build_client;

/// What an operator is told when a rollout is rolled back
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollbackNotice {
    /// Controller run that rolled back
    pub run_id: Uuid,
    /// Release identifier
    pub release: String,
    /// Zero-based stage that failed
    pub stage: usize,
    /// Weight that was in effect before the rollback
    pub weight: u8,
    /// Why
    pub reason: RollbackReason,
    /// Least healthy metric value observed in the failing run
    pub metric_value: Option<f64>,
    /// Threshold gated on
    pub threshold: f64,
    /// Metric name
    pub metric: String,
    /// Control plane error that aborted the rollout or refused the rollback
    pub rollback_error: Option<String>,
    /// When the rollback was issued
    pub at: DateTime<Utc>,
}

/// Delivers rollback notices
#[async_trait]
pub trait RolloutNotifier: Send + Sync {
    /// Deliver `notice`
    async fn notify(&self, notice: &RollbackNotice) -> Result<()>;
}

/// Build the notifier for an optional webhook URL
pub fn from_config(webhook: Option<&str>, timeout: Duration) -> Result<Box<dyn RolloutNotifier>> {
    Ok(match webhook {
        Some(url) => Box::new(WebhookNotifier::new(url, timeout)?),
        None => Box::new(LogNotifier),
    })
}

/// Writes notices to the error log
pub struct LogNotifier;

#[async_trait]
impl RolloutNotifier for LogNotifier {
    async fn notify(&self, notice: &RollbackNotice) -> Result<()> {
        error!(
            run_id = %notice.run_id,
            release = %notice.release,
            stage = notice.stage,
            weight = notice.weight,
            reason = ?notice.reason,
            metric = %notice.metric,
            value = ?notice.metric_value,
            threshold = notice.threshold,
            rollback_error = ?notice.rollback_error,
            "Rollout rolled back"
        );
        Ok(())
    }
}

/// POSTs notices as JSON to a webhook
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    /// Create a notifier for `url`
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl RolloutNotifier for WebhookNotifier {
    async fn notify(&self, notice: &RollbackNotice) -> Result<()> {
        // Logged regardless of webhook delivery
        LogNotifier.notify(notice).await?;

        let response = self.client.post(&self.url).json(notice).send().await?;
        let status = response.status();
        if status.is_success() {
            info!(url = %self.url, "Rollback notice delivered");
        } else {
            warn!(url = %self.url, %status, "Rollback webhook rejected notice");
        }
        Ok(())
    }
}
