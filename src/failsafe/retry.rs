//! Retry logic with jittered exponential backoff
//!
//! Every attempt goes through the dependency's [`CircuitBreaker`] first. A
//! rejection returns at once without spending an attempt; an admitted attempt
//! that fails counts once against the breaker.

use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use rand::RngExt;
use tokio::time::{Instant, sleep, timeout};
use tracing::debug;

use super::CircuitBreaker;
use crate::config::RetryConfig;
use crate::{Error, Result};

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Whether retries are enabled
    pub enabled: bool,
    /// Maximum attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt, doubled for each later one
    pub initial_backoff: Duration,
    /// Maximum backoff
    pub max_backoff: Duration,
    /// Bound on a single attempt
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    /// Create from config
    #[must_use]
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
            attempt_timeout: config.attempt_timeout,
        }
    }

    /// Un-jittered delays between attempts: `base * 2^n` capped at `max_backoff`
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let retries = if self.enabled {
            self.max_attempts.saturating_sub(1) as usize
        } else {
            0
        };
        ExponentialBuilder::default()
            .with_min_delay(self.initial_backoff)
            .with_max_delay(self.max_backoff)
            .with_factor(2.0)
            .with_max_times(retries)
            .build()
    }
}

/// Full jitter: uniform in `[0, delay]`
#[must_use]
pub fn jitter(delay: Duration) -> Duration {
    let ceiling = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    if ceiling == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=ceiling))
}

/// Execute `f` through `breaker` with retry
///
/// `deadline` stops retrying early when the next backoff would end past it.
///
/// # Errors
///
/// - [`Error::BreakerOpen`] as soon as the breaker rejects an attempt
/// - the failure itself when it is not retryable
/// - [`Error::RetriesExhausted`] carrying the last failure otherwise
#[tracing::instrument(skip(policy, breaker, f), fields(dependency = %breaker.name()))]
pub async fn with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    breaker: &CircuitBreaker,
    deadline: Option<Instant>,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delays = policy.delays();
    let mut attempts = 0u32;

    loop {
        let permit = breaker.try_acquire()?;
        attempts += 1;

        let outcome = match timeout(policy.attempt_timeout, f()).await {
            Ok(result) => result,
            Err(_) => Err(Error::dependency(
                breaker.name(),
                format!("attempt timed out after {:?}", policy.attempt_timeout),
            )),
        };

        let e = match outcome {
            Ok(value) => {
                permit.success();
                return Ok(value);
            }
            Err(e) => {
                permit.failure();
                e
            }
        };

        if !e.is_retryable() {
            debug!(attempts, error = %e, "Non-retryable failure");
            return Err(e);
        }

        let exhausted = || Error::RetriesExhausted {
            dependency: breaker.name().to_string(),
            attempts,
            last: e.to_string(),
        };

        let Some(delay) = delays.next() else {
            debug!(attempts, "Max retry attempts reached");
            return Err(exhausted());
        };
        let delay = jitter(delay);

        if deadline.is_some_and(|d| Instant::now() + delay >= d) {
            debug!(attempts, delay_ms = delay.as_millis() as u64, "Backoff would cross the deadline");
            return Err(exhausted());
        }

        debug!(
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            error = %e,
            "Retrying after backoff"
        );
        sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerConfig;
    use gateway_core::BreakerStatus;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            enabled: true,
            max_attempts,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            attempt_timeout: Duration::from_secs(2),
        }
    }

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "rerank",
            &CircuitBreakerConfig {
                enabled: true,
                failure_threshold: threshold,
                cooldown: Duration::from_secs(30),
            },
        )
    }

    #[test]
    fn delays_double_and_cap() {
        let mut p = policy(6);
        p.max_backoff = Duration::from_millis(500);
        let delays: Vec<_> = p.delays().collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(500),
                Duration::from_millis(500),
            ]
        );
    }

    #[test]
    fn jitter_stays_within_delay() {
        for _ in 0..100 {
            assert!(jitter(Duration::from_millis(50)) <= Duration::from_millis(50));
        }
        assert_eq!(jitter(Duration::ZERO), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = &AtomicU32::new(0);
        let breaker = breaker(10);

        let result = with_retry(&policy(3), &breaker, None, move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::dependency("rerank", "503"))
            } else {
                Ok("ok")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(breaker.status(), BreakerStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_last_failure() {
        let breaker = breaker(10);
        let result: Result<()> = with_retry(&policy(3), &breaker, None, || async {
            Err(Error::dependency("rerank", "still down"))
        })
        .await;

        match result {
            Err(Error::RetriesExhausted { attempts, last, .. }) => {
                assert_eq!(attempts, 3);
                assert!(last.contains("still down"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(breaker.snapshot().consecutive_failures, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_failure_returns_immediately() {
        let calls = &AtomicU32::new(0);
        let breaker = breaker(10);
        let result: Result<()> = with_retry(&policy(5), &breaker, None, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::dependency_permanent("rerank", "400"))
        })
        .await;

        assert!(matches!(result, Err(Error::DependencyFailure { transient: false, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(breaker.snapshot().consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_rejection_stops_without_calling() {
        let calls = &AtomicU32::new(0);
        let breaker = breaker(2);
        let result: Result<()> = with_retry(&policy(5), &breaker, None, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::dependency("rerank", "503"))
        })
        .await;

        assert!(matches!(result, Err(Error::BreakerOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempt_times_out_as_a_failure() {
        let mut p = policy(1);
        p.attempt_timeout = Duration::from_millis(50);
        let breaker = breaker(10);

        let result: Result<()> = with_retry(&p, &breaker, None, || async {
            sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        match result {
            Err(Error::RetriesExhausted { last, .. }) => assert!(last.contains("timed out")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_cuts_retries_short() {
        let calls = &AtomicU32::new(0);
        let mut p = policy(10);
        p.initial_backoff = Duration::from_secs(1);
        p.max_backoff = Duration::from_secs(1);
        let breaker = breaker(100);
        let deadline = Instant::now() + Duration::from_millis(10);

        let started = Instant::now();
        let result: Result<()> = with_retry(&p, &breaker, Some(deadline), move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::dependency("rerank", "503"))
        })
        .await;

        assert!(matches!(result, Err(Error::RetriesExhausted { .. })));
        assert!(Instant::now() - started < Duration::from_secs(1));
        assert!(calls.load(Ordering::SeqCst) >= 1);
    }
}
