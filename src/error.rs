//! Error types for the rerank gateway

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for the rerank gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Rerank gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Dependency circuit is open, no attempt was made
    #[error("Circuit open for {dependency}, retry in {retry_after:?}")]
    BreakerOpen {
        /// Dependency name
        dependency: String,
        /// Remaining cooldown (zero while a probe is in flight)
        retry_after: Duration,
    },

    /// A dependency attempt was made and failed
    #[error("{dependency} call failed: {message}")]
    DependencyFailure {
        /// Dependency name
        dependency: String,
        /// Failure detail
        message: String,
        /// Whether another attempt may succeed
        transient: bool,
    },

    /// Every backoff attempt failed
    #[error("{dependency} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Dependency name
        dependency: String,
        /// Attempts made
        attempts: u32,
        /// Message of the final failure
        last: String,
    },

    /// Vector search failed (retried with backoff, never through the rerank breaker)
    #[error("Vector search failed: {0}")]
    SearchFailure(String),

    /// Request deadline elapsed while waiting
    #[error("Deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    /// Metric source could not produce a value
    #[error("Metric unavailable: {0}")]
    MetricUnavailable(String),

    /// Metric breached the analysis threshold
    #[error("Analysis failed: {metric} = {value} breached threshold {threshold}")]
    AnalysisFail {
        /// Metric description
        metric: String,
        /// Worst observed value
        value: f64,
        /// Configured threshold
        threshold: f64,
    },

    /// A rollout sequence is already active
    #[error("Rollout already in progress: {0}")]
    RolloutInProgress(String),

    /// Deployment control plane rejected or failed a command
    #[error("Control plane error: {0}")]
    ControlPlane(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server shutdown
    #[error("Server shutdown")]
    Shutdown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a transient dependency failure
    pub fn dependency(dependency: &str, message: impl Into<String>) -> Self {
        Self::DependencyFailure {
            dependency: dependency.to_string(),
            message: message.into(),
            transient: true,
        }
    }

    /// Create a dependency failure that retrying will not fix
    pub fn dependency_permanent(dependency: &str, message: impl Into<String>) -> Self {
        Self::DependencyFailure {
            dependency: dependency.to_string(),
            message: message.into(),
            transient: false,
        }
    }

    /// Whether the backoff executor should try again
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::DependencyFailure { transient, .. } => *transient,
            Self::SearchFailure(_) => true,
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Io(_) => true,
            _ => false,
        }
    }

    /// Whether the stale-cache fallback may answer instead of this error
    #[must_use]
    pub fn is_degradable(&self) -> bool {
        matches!(
            self,
            Self::BreakerOpen { .. } | Self::RetriesExhausted { .. } | Self::DependencyFailure { .. }
        )
    }

    /// HTTP status for the gateway's JSON error responses
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::BreakerOpen { .. } | Self::RetriesExhausted { .. } | Self::DependencyFailure { .. } => 503,
            Self::SearchFailure(_) => 502,
            Self::DeadlineExceeded(_) => 504,
            Self::RolloutInProgress(_) => 409,
            _ => 500,
        }
    }

    /// Short machine-readable code used in response bodies
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::BreakerOpen { .. } => "circuit_open",
            Self::RetriesExhausted { .. } | Self::DependencyFailure { .. } => "rerank_failed",
            Self::SearchFailure(_) => "search_failed",
            Self::DeadlineExceeded(_) => "deadline_exceeded",
            Self::RolloutInProgress(_) => "rollout_in_progress",
            _ => "internal_error",
        }
    }

    /// Rebuild an owned error from one shared between single-flight waiters.
    ///
    /// Variants wrapping non-cloneable sources collapse to `Internal`.
    #[must_use]
    pub fn from_shared(shared: &Self) -> Self {
        match shared {
            Self::Config(m) => Self::Config(m.clone()),
            Self::BreakerOpen {
                dependency,
                retry_after,
            } => Self::BreakerOpen {
                dependency: dependency.clone(),
                retry_after: *retry_after,
            },
            Self::DependencyFailure {
                dependency,
                message,
                transient,
            } => Self::DependencyFailure {
                dependency: dependency.clone(),
                message: message.clone(),
                transient: *transient,
            },
            Self::RetriesExhausted {
                dependency,
                attempts,
                last,
            } => Self::RetriesExhausted {
                dependency: dependency.clone(),
                attempts: *attempts,
                last: last.clone(),
            },
            Self::SearchFailure(m) => Self::SearchFailure(m.clone()),
            Self::DeadlineExceeded(d) => Self::DeadlineExceeded(*d),
            Self::MetricUnavailable(m) => Self::MetricUnavailable(m.clone()),
            Self::AnalysisFail {
                metric,
                value,
                threshold,
            } => Self::AnalysisFail {
                metric: metric.clone(),
                value: *value,
                threshold: *threshold,
            },
            Self::RolloutInProgress(m) => Self::RolloutInProgress(m.clone()),
            Self::ControlPlane(m) => Self::ControlPlane(m.clone()),
            Self::Shutdown => Self::Shutdown,
            other => Self::Internal(other.to_string()),
        }
    }
}
