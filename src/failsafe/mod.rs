//! Failsafe mechanisms: circuit breaker and retry with backoff

mod circuit_breaker;
mod retry;

pub use circuit_breaker::{BreakerSnapshot, CallPermit, CircuitBreaker};
pub use retry::{RetryPolicy, jitter, with_retry};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::Result;
use crate::config::{CircuitBreakerConfig, FailsafeConfig, RetryConfig};

/// Combined failsafe wrapper for one dependency
#[derive(Clone)]
pub struct Failsafe {
    /// Circuit breaker
    pub circuit_breaker: Arc<CircuitBreaker>,
    /// Retry policy
    pub retry_policy: RetryPolicy,
}

impl Failsafe {
    /// Create a new failsafe from configuration
    #[must_use]
    pub fn new(name: &str, config: &FailsafeConfig) -> Self {
        Self {
            circuit_breaker: Arc::new(CircuitBreaker::new(name, &config.circuit_breaker)),
            retry_policy: RetryPolicy::new(&config.retry),
        }
    }

    /// Retry-only wrapper: the breaker admits every call
    #[must_use]
    pub fn retry_only(name: &str, retry: &RetryConfig) -> Self {
        let breaker = CircuitBreakerConfig {
            enabled: false,
            failure_threshold: 1,
            cooldown: Duration::ZERO,
        };
        Self {
            circuit_breaker: Arc::new(CircuitBreaker::new(name, &breaker)),
            retry_policy: RetryPolicy::new(retry),
        }
    }

    /// Run `f` through the breaker with retry, see [`with_retry`]
    ///
    /// # Errors
    ///
    /// Propagates [`with_retry`]'s errors.
    pub async fn call<F, Fut, T>(&self, deadline: Option<Instant>, f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        with_retry(&self.retry_policy, &self.circuit_breaker, deadline, f).await
    }

    /// Current breaker state for health reporting
    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        self.circuit_breaker.snapshot()
    }
}
