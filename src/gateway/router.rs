//! HTTP router and handlers

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State, rejection::JsonRejection},
    http::{HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use gateway_core::BreakerStatus;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;
use tower_http::{catch_panic::CatchPanicLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, warn};

use crate::Error;
use crate::backend::Hit;
use crate::resolver::{Query, QueryResolver, Source};
use crate::rollout::RolloutController;
use crate::telemetry::exporter::{self, InflightGuard};
use crate::telemetry::MetricAggregator;

/// Longest accepted query text, in characters
pub const MAX_QUERY_CHARS: usize = 2000;
/// Largest accepted `k`
pub const MAX_TOP_K: usize = 200;
/// `k` when the request omits it
pub const DEFAULT_TOP_K: usize = 50;

/// Shared application state
pub struct AppState {
    /// Query resolver
    pub resolver: Arc<QueryResolver>,
    /// Latency aggregator
    pub aggregator: Arc<MetricAggregator>,
    /// Rollout controller, when a rollout is configured
    pub rollout: Option<Arc<RolloutController>>,
    /// Prometheus render handle
    #[cfg(feature = "metrics")]
    pub metrics: Option<metrics_exporter_prometheus::PrometheusHandle>,
    /// Route label and path of the query endpoint
    pub route: String,
    /// Deadline for one query
    pub request_timeout: Duration,
}

/// Create the router
pub fn create_router(state: Arc<AppState>, cors_origins: &[String], max_body_size: usize) -> Router {
    Router::new()
        .route(&state.route, post(rag_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .route("/rollout", get(rollout_handler))
        .route("/cache/invalidate", post(invalidate_handler))
        .layer(DefaultBodyLimit::max(max_body_size))
        .layer(cors_layer(cors_origins))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(origin = %origin, error = %e, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
}

/// Body of a query request
#[derive(Debug, Deserialize)]
pub struct RagRequest {
    /// Query text
    pub q: String,
    /// Results wanted
    #[serde(default = "default_top_k")]
    pub k: usize,
    /// Whether to rerank the candidates
    #[serde(default)]
    pub rerank: bool,
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

impl RagRequest {
    fn validate(self) -> Result<Query, String> {
        let chars = self.q.chars().count();
        if self.q.trim().is_empty() {
            return Err("q must not be empty".to_string());
        }
        if chars > MAX_QUERY_CHARS {
            return Err(format!("q must be at most {MAX_QUERY_CHARS} characters, got {chars}"));
        }
        if !(1..=MAX_TOP_K).contains(&self.k) {
            return Err(format!("k must be between 1 and {MAX_TOP_K}, got {}", self.k));
        }
        Ok(Query {
            text: self.q,
            top_k: self.k,
            rerank: self.rerank,
        })
    }
}

/// Body of a query response
#[derive(Debug, Serialize)]
struct RagResponse<'a> {
    hits: &'a [Hit],
    stale: bool,
    source: Source,
}

/// Query handler (POST /rag)
async fn rag_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RagRequest>, JsonRejection>,
) -> Response {
    let _inflight = InflightGuard::new(&state.route);
    let started = Instant::now();

    let response = match payload {
        Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            (rejection.status(), Json(json!({ "error": "payload_too_large" }))).into_response()
        }
        Err(rejection) => unprocessable(&rejection.body_text()),
        Ok(Json(request)) => match request.validate() {
            Err(message) => unprocessable(&message),
            Ok(query) => {
                let deadline = started + state.request_timeout;
                match state.resolver.resolve(&query, deadline).await {
                    Ok(resolution) => {
                        debug!(
                            fingerprint = %resolution.fingerprint.short(),
                            source = ?resolution.source,
                            hits = resolution.result.hits.len(),
                            "Query resolved"
                        );
                        Json(RagResponse {
                            hits: &resolution.result.hits,
                            stale: resolution.is_stale(),
                            source: resolution.source,
                        })
                        .into_response()
                    }
                    Err(e) => error_response(&e),
                }
            }
        },
    };

    exporter::record_request("POST", &state.route, response.status().as_u16(), started.elapsed());
    response
}

fn unprocessable(message: &str) -> Response {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(json!({ "error": "invalid_request", "message": message })),
    )
        .into_response()
}

/// Map a resolver error to its HTTP response
fn error_response(error: &Error) -> Response {
    let status = StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        warn!(error = %error, status = status.as_u16(), "Query failed");
    }

    let mut body = json!({ "error": error.code(), "message": error.to_string() });
    let retry_after = match error {
        Error::BreakerOpen { retry_after, .. } => Some(*retry_after),
        _ => None,
    };
    if let Some(retry_after) = retry_after {
        body["retry_after_ms"] = json!(u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX));
    }

    let mut response = (status, Json(body)).into_response();
    if let Some(retry_after) = retry_after {
        let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(secs));
    }
    response
}

/// Liveness (GET /health)
///
/// Always 200 while the process serves requests; dependency state is
/// reported in the body only.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let breaker = state.resolver.rerank_failsafe().snapshot();
    let degraded = breaker.status == BreakerStatus::Open;

    Json(json!({
        "ok": true,
        "status": if degraded { "degraded" } else { "healthy" },
        "version": env!("CARGO_PKG_VERSION"),
        "rerank": breaker,
        "cache": state.resolver.cache().stats(),
        "in_flight": state.resolver.in_flight(),
        "telemetry": state.aggregator.stats(),
        "rollout": state.rollout.as_ref().map(|r| r.snapshot().status),
    }))
}

/// Readiness (GET /ready): 503 while the rerank breaker is open
async fn ready_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let breaker = state.resolver.rerank_failsafe().snapshot();
    let ready = breaker.status != BreakerStatus::Open;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(json!({ "ready": ready, "rerank": breaker })))
}

/// Prometheus exposition (GET /metrics)
#[cfg(feature = "metrics")]
async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

/// Prometheus exposition (GET /metrics)
#[cfg(not(feature = "metrics"))]
async fn metrics_handler() -> Response {
    (StatusCode::NOT_FOUND, "built without the metrics feature").into_response()
}

/// Rollout progress (GET /rollout)
async fn rollout_handler(State(state): State<Arc<AppState>>) -> Response {
    match &state.rollout {
        Some(controller) => Json(controller.snapshot()).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "no_rollout", "message": "no rollout configured" })),
        )
            .into_response(),
    }
}

/// Re-index notification (POST /cache/invalidate)
async fn invalidate_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let index_version = state.resolver.bump_index_version();
    Json(json!({ "index_version": index_version }))
}
