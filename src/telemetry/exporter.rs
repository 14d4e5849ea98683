//! Prometheus exposition
//!
//! Metric names and labels match the dashboards built for the gateway:
//!
//! | metric | type | labels |
//! |---|---|---|
//! | `http_server_request_duration_seconds` | histogram | `method`, `route`, `status` |
//! | `reranker_cache_hit_total` | counter | `route` |
//! | `reranker_cache_miss_total` | counter | `route` |
//! | `rerank_errors_total` | counter | |
//! | `search_errors_total` | counter | |
//! | `inflight_requests` | gauge | `route` |
//!
//! Recording goes through the `metrics` facade and is a no-op until a
//! recorder is installed.

use std::time::Duration;

use telemetry_metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Request latency histogram
pub const REQUEST_DURATION: &str = "http_server_request_duration_seconds";
/// Histogram bucket bounds in seconds
pub const REQUEST_DURATION_BUCKETS: &[f64] = &[0.05, 0.1, 0.2, 0.5, 1.0, 2.0, 5.0];
/// Fresh cache hits
pub const CACHE_HIT: &str = "reranker_cache_hit_total";
/// Cache misses
pub const CACHE_MISS: &str = "reranker_cache_miss_total";
/// Failed rerank resolutions
pub const RERANK_ERRORS: &str = "rerank_errors_total";
/// Failed embedding or vector search calls
pub const SEARCH_ERRORS: &str = "search_errors_total";
/// Requests being served
pub const INFLIGHT: &str = "inflight_requests";

/// Install the global Prometheus recorder and return its render handle
///
/// # Errors
///
/// Returns an error if the bucket layout is rejected or a recorder is
/// already installed.
#[cfg(feature = "metrics")]
pub fn install_recorder() -> crate::Result<metrics_exporter_prometheus::PrometheusHandle> {
    use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(REQUEST_DURATION.to_string()), REQUEST_DURATION_BUCKETS)
        .map_err(|e| crate::Error::Config(format!("invalid histogram buckets: {e}")))?
        .install_recorder()
        .map_err(|e| crate::Error::Internal(format!("failed to install metrics recorder: {e}")))?;

    describe();
    Ok(handle)
}

fn describe() {
    describe_histogram!(REQUEST_DURATION, telemetry_metrics::Unit::Seconds, "HTTP request latency");
    describe_counter!(CACHE_HIT, "Rerank results served from a fresh cache entry");
    describe_counter!(CACHE_MISS, "Rerank lookups with no fresh cache entry");
    describe_counter!(RERANK_ERRORS, "Queries whose rerank step failed");
    describe_counter!(SEARCH_ERRORS, "Queries whose embedding or vector search failed");
    describe_gauge!(INFLIGHT, "Requests currently being served");
}

/// Record one served HTTP request
pub fn record_request(method: &str, route: &str, status: u16, elapsed: Duration) {
    histogram!(
        REQUEST_DURATION,
        "method" => method.to_string(),
        "route" => route.to_string(),
        "status" => status.to_string()
    )
    .record(elapsed.as_secs_f64());
}

/// Count a fresh cache hit
pub fn record_cache_hit(route: &str) {
    counter!(CACHE_HIT, "route" => route.to_string()).increment(1);
}

/// Count a cache miss
pub fn record_cache_miss(route: &str) {
    counter!(CACHE_MISS, "route" => route.to_string()).increment(1);
}

/// Count a failed rerank
pub fn record_rerank_error() {
    counter!(RERANK_ERRORS).increment(1);
}

/// Count a failed search
pub fn record_search_error() {
    counter!(SEARCH_ERRORS).increment(1);
}

/// Holds `inflight_requests{route}` up for its lifetime
pub struct InflightGuard {
    route: String,
}

impl InflightGuard {
    /// Increment the gauge for `route`
    #[must_use]
    pub fn new(route: &str) -> Self {
        gauge!(INFLIGHT, "route" => route.to_string()).increment(1.0);
        Self {
            route: route.to_string(),
        }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        gauge!(INFLIGHT, "route" => self.route.clone()).decrement(1.0);
    }
}

#[cfg(all(test, feature = "metrics"))]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};

    #[test]
    fn renders_names_labels_and_buckets() {
        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(Matcher::Full(REQUEST_DURATION.to_string()), REQUEST_DURATION_BUCKETS)
            .unwrap()
            .build_recorder();
        let handle = recorder.handle();

        telemetry_metrics::with_local_recorder(&recorder, || {
            record_request("POST", "/rag", 200, Duration::from_millis(120));
            record_cache_hit("/rag");
            record_cache_miss("/rag");
            record_cache_miss("/rag");
            record_rerank_error();
            record_search_error();
            let _guard = InflightGuard::new("/rag");
        });

        let text = handle.render();
        assert!(text.contains(
            "http_server_request_duration_seconds_bucket{method=\"POST\",route=\"/rag\",status=\"200\",le=\"0.2\"} 1"
        ));
        assert!(text.contains(
            "http_server_request_duration_seconds_bucket{method=\"POST\",route=\"/rag\",status=\"200\",le=\"0.1\"} 0"
        ));
        assert!(text.contains("reranker_cache_hit_total{route=\"/rag\"} 1"));
        assert!(text.contains("reranker_cache_miss_total{route=\"/rag\"} 2"));
        assert!(text.contains("rerank_errors_total 1"));
        assert!(text.contains("search_errors_total 1"));
        assert!(text.contains("inflight_requests{route=\"/rag\"} 0"));
    }
}
