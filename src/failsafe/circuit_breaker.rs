//! Circuit breaker service
//!
//! Wraps the pure [`gateway_core::breaker`] state machine in a per-dependency
//! mutex. Callers take a [`CallPermit`] before touching the dependency and
//! report the outcome through it; a probe permit dropped without an outcome
//! (cancelled request, timed-out waiter) frees the half-open probe slot.

use gateway_core::{
    BreakerEvent, BreakerPolicy, BreakerState, BreakerStatus, Decision, breaker_transition,
};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;
use crate::{Error, Result};

/// Circuit breaker for one downstream dependency
pub struct CircuitBreaker {
    name: String,
    enabled: bool,
    policy: BreakerPolicy,
    state: Mutex<BreakerState>,
}

/// Serializable view of a breaker for `/health`
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    /// Dependency name
    pub name: String,
    /// Current status
    pub status: BreakerStatus,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Remaining cooldown while open
    pub retry_after_ms: u64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    #[must_use]
    pub fn new(name: &str, config: &CircuitBreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            enabled: config.enabled,
            policy: BreakerPolicy {
                failure_threshold: config.failure_threshold,
                cooldown: config.cooldown,
            },
            state: Mutex::new(BreakerState::closed()),
        }
    }

    /// Dependency name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask to make one call
    ///
    /// # Errors
    ///
    /// Returns [`Error::BreakerOpen`] while the circuit is open, or while it is
    /// half-open and the probe slot is taken. Rejected callers are not queued.
    #[tracing::instrument(skip(self), fields(dependency = %self.name))]
    pub fn try_acquire(&self) -> Result<CallPermit<'_>> {
        if !self.enabled {
            return Ok(CallPermit::new(self, false));
        }

        match self.apply(BreakerEvent::Request) {
            Decision::Admit => {
                tracing::trace!("Circuit closed, allowing request");
                Ok(CallPermit::new(self, false))
            }
            Decision::AdmitProbe => {
                debug!("Circuit half-open, admitting probe request");
                Ok(CallPermit::new(self, true))
            }
            Decision::Reject { retry_after } => {
                debug!(retry_after_ms = retry_after.as_millis() as u64, "Circuit open, rejecting request");
                Err(Error::BreakerOpen {
                    dependency: self.name.clone(),
                    retry_after,
                })
            }
            Decision::Recorded => Err(Error::Internal(format!(
                "breaker {} returned an outcome decision for a request",
                self.name
            ))),
        }
    }

    /// Get current status
    pub fn status(&self) -> BreakerStatus {
        self.state.lock().status
    }

    /// Current state for health reporting
    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = *self.state.lock();
        let now = Instant::now().into_std();
        BreakerSnapshot {
            name: self.name.clone(),
            status: state.status,
            consecutive_failures: state.consecutive_failures,
            retry_after_ms: state.remaining_cooldown(now, &self.policy).as_millis() as u64,
        }
    }

    fn apply(&self, event: BreakerEvent) -> Decision {
        let now = Instant::now().into_std();
        let mut state = self.state.lock();
        let before = state.status;
        let (next, decision) = breaker_transition(*state, event, now, &self.policy);
        *state = next;
        drop(state);

        if before != next.status {
            match next.status {
                BreakerStatus::Closed => info!(dependency = %self.name, "Circuit breaker closed"),
                BreakerStatus::Open => warn!(
                    dependency = %self.name,
                    failures = next.consecutive_failures,
                    cooldown_ms = self.policy.cooldown.as_millis() as u64,
                    "Circuit breaker opened"
                ),
                BreakerStatus::HalfOpen => debug!(dependency = %self.name, "Circuit breaker half-open"),
            }
        }
        decision
    }
}

/// Admission to make one call; report the outcome with
/// [`success`](Self::success) or [`failure`](Self::failure)
#[must_use = "an unreported probe permit releases the probe slot on drop"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    reported: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            reported: false,
        }
    }

    /// Whether this call is the half-open probe
    #[must_use]
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// The call succeeded
    pub fn success(mut self) {
        self.reported = true;
        if self.breaker.enabled {
            self.breaker.apply(BreakerEvent::Success { probe: self.probe });
        }
    }

    /// The call failed
    pub fn failure(mut self) {
        self.reported = true;
        if self.breaker.enabled {
            self.breaker.apply(BreakerEvent::Failure { probe: self.probe });
        }
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.reported && self.probe && self.breaker.enabled {
            debug!(dependency = %self.breaker.name, "Probe abandoned, releasing slot");
            self.breaker.apply(BreakerEvent::ProbeAbandoned);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

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

    fn fail_once(breaker: &CircuitBreaker) {
        breaker.try_acquire().unwrap().failure();
    }

    #[tokio::test(start_paused = true)]
    async fn opens_at_threshold_and_rejects() {
        let breaker = breaker(3);
        fail_once(&breaker);
        fail_once(&breaker);
        assert_eq!(breaker.status(), BreakerStatus::Closed);
        fail_once(&breaker);
        assert_eq!(breaker.status(), BreakerStatus::Open);

        let err = breaker.try_acquire().err().unwrap();
        match err {
            Error::BreakerOpen { dependency, retry_after } => {
                assert_eq!(dependency, "rerank");
                assert_eq!(retry_after, Duration::from_secs(30));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn single_probe_after_cooldown() {
        let breaker = breaker(1);
        fail_once(&breaker);

        tokio::time::advance(Duration::from_secs(30)).await;
        let probe = breaker.try_acquire().unwrap();
        assert!(probe.is_probe());
        assert_eq!(breaker.status(), BreakerStatus::HalfOpen);
        assert!(matches!(
            breaker.try_acquire(),
            Err(Error::BreakerOpen { .. })
        ));

        probe.success();
        assert_eq!(breaker.status(), BreakerStatus::Closed);
        assert!(!breaker.try_acquire().unwrap().is_probe());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_restarts_cooldown() {
        let breaker = breaker(1);
        fail_once(&breaker);
        tokio::time::advance(Duration::from_secs(30)).await;

        breaker.try_acquire().unwrap().failure();
        assert_eq!(breaker.status(), BreakerStatus::Open);
        assert_eq!(breaker.snapshot().retry_after_ms, 30_000);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(breaker.try_acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_probe_releases_the_slot() {
        let breaker = breaker(1);
        fail_once(&breaker);
        tokio::time::advance(Duration::from_secs(30)).await;

        drop(breaker.try_acquire().unwrap());
        assert_eq!(breaker.status(), BreakerStatus::HalfOpen);
        assert!(breaker.try_acquire().unwrap().is_probe());
    }

    #[test]
    fn disabled_breaker_always_admits() {
        let breaker = CircuitBreaker::new(
            "rerank",
            &CircuitBreakerConfig {
                enabled: false,
                failure_threshold: 1,
                cooldown: Duration::from_secs(30),
            },
        );
        for _ in 0..5 {
            fail_once(&breaker);
        }
        assert_eq!(breaker.status(), BreakerStatus::Closed);
        assert!(breaker.try_acquire().is_ok());
    }
}
