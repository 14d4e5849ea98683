//! Metric sources consulted during rollout analysis

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::backend::http::build_client;
use crate::config::{MetricSourceConfig, RolloutMetric};
use crate::telemetry::MetricAggregator;
use crate::telemetry::exporter::{CACHE_HIT, CACHE_MISS, REQUEST_DURATION};
use crate::{Error, Result};

/// Scalar metric query
#[async_trait]
pub trait MetricSource: Send + Sync {
    /// Current value of `metric` over the trailing `window`
    ///
    /// Latency is reported in milliseconds, hit rate in [0, 1]. A source that
    /// has no data returns [`Error::MetricUnavailable`].
    async fn query(&self, metric: &RolloutMetric, window: Duration) -> Result<f64>;
}

/// Build the configured source
pub fn from_config(
    config: &MetricSourceConfig,
    aggregator: Arc<MetricAggregator>,
    timeout: Duration,
) -> Result<Box<dyn MetricSource>> {
    Ok(match config {
        MetricSourceConfig::InProcess => Box::new(InProcessSource::new(aggregator)),
        MetricSourceConfig::Prometheus { url, query } => {
            Box::new(PrometheusSource::new(url, query.clone(), timeout)?)
        }
    })
}

/// Reads the gateway's own [`MetricAggregator`]
pub struct InProcessSource {
    aggregator: Arc<MetricAggregator>,
}

impl InProcessSource {
    /// Wrap an aggregator
    #[must_use]
    pub fn new(aggregator: Arc<MetricAggregator>) -> Self {
        Self { aggregator }
    }
}

#[async_trait]
impl MetricSource for InProcessSource {
    async fn query(&self, metric: &RolloutMetric, window: Duration) -> Result<f64> {
        let value = match metric {
            RolloutMetric::LatencyQuantile { quantile, route } => {
                self.aggregator.quantile(route, *quantile, window)
            }
            RolloutMetric::HitRate { route } => self.aggregator.hit_rate(route, window),
        };
        value.ok_or_else(|| {
            Error::MetricUnavailable(format!(
                "no {} samples for {} in the last {window:?}",
                metric.name(),
                metric.route()
            ))
        })
    }
}

/// Prometheus HTTP API (`GET /api/v1/query`)
pub struct PrometheusSource {
    client: Client,
    endpoint: String,
    query_override: Option<String>,
}

#[derive(Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct QueryData {
    #[serde(default)]
    result: Vec<VectorSample>,
}

#[derive(Deserialize)]
struct VectorSample {
    /// `[unix_time, "value"]`
    value: (f64, String),
}

impl PrometheusSource {
    /// Create a source for the Prometheus server at `base_url`
    ///
    /// `query_override` replaces the generated PromQL; `{window}` in it is
    /// substituted with the range (e.g. `120s`).
    pub fn new(base_url: &str, query_override: Option<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            endpoint: format!("{}/api/v1/query", base_url.trim_end_matches('/')),
            query_override,
        })
    }

    /// PromQL for `metric` over `window`
    #[must_use]
    pub fn promql(&self, metric: &RolloutMetric, window: Duration) -> String {
        let range = format!("{}s", window.as_secs().max(1));
        if let Some(custom) = &self.query_override {
            return custom.replace("{window}", &range);
        }
        match metric {
            RolloutMetric::LatencyQuantile { quantile, route } => format!(
                "histogram_quantile({quantile}, sum(rate({REQUEST_DURATION}_bucket{{route=\"{route}\"}}[{range}])) by (le)) * 1000"
            ),
            RolloutMetric::HitRate { route } => {
                let hits = format!("sum(rate({CACHE_HIT}{{route=\"{route}\"}}[{range}]))");
                let misses = format!("sum(rate({CACHE_MISS}{{route=\"{route}\"}}[{range}]))");
                format!("{hits} / ({hits} + {misses})")
            }
        }
    }
}

#[async_trait]
impl MetricSource for PrometheusSource {
    async fn query(&self, metric: &RolloutMetric, window: Duration) -> Result<f64> {
        let promql = self.promql(metric, window);
        debug!(query = %promql, "Querying Prometheus");

        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("query", promql.as_str())])
            .send()
            .await
            .map_err(|e| Error::MetricUnavailable(format!("prometheus request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::MetricUnavailable(format!("prometheus HTTP {status}: {body}")));
        }

        let parsed: QueryResponse = response
            .json()
            .await
            .map_err(|e| Error::MetricUnavailable(format!("invalid prometheus response: {e}")))?;

        parse_scalar(parsed)
    }
}

fn parse_scalar(response: QueryResponse) -> Result<f64> {
    if response.status != "success" {
        return Err(Error::MetricUnavailable(format!(
            "prometheus query failed: {}",
            response.error.unwrap_or(response.status)
        )));
    }

    let sample = response
        .data
        .and_then(|d| d.result.into_iter().next())
        .ok_or_else(|| Error::MetricUnavailable("prometheus returned no series".to_string()))?;

    let value: f64 = sample
        .value
        .1
        .parse()
        .map_err(|e| Error::MetricUnavailable(format!("unparseable sample value: {e}")))?;

    if value.is_finite() {
        Ok(value)
    } else {
        Err(Error::MetricUnavailable(format!("non-finite sample value {value}")))
    }
}
