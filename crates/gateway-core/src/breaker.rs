//! Circuit breaker state machine
//!
//! ```text
//! Closed   --failures >= threshold-->  Open
//! Open     --cooldown elapsed------->  HalfOpen (single probe admitted)
//! HalfOpen --probe succeeded-------->  Closed
//! HalfOpen --probe failed----------->  Open (cooldown restarts)
//! ```
//!
//! [`transition`] is the only way a [`BreakerState`] changes. The caller is
//! responsible for serializing calls (the gateway holds a mutex per
//! dependency).

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Externally visible breaker status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerStatus {
    /// Calls pass through, failures are counted
    Closed,
    /// Calls fail fast until the cooldown elapses
    Open,
    /// One trial call decides between Closed and Open
    HalfOpen,
}

impl std::fmt::Display for BreakerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Tuning values for one breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerPolicy {
    /// Consecutive failures that open the circuit (values below 1 act as 1)
    pub failure_threshold: u32,
    /// Time the circuit stays open before a probe is admitted
    pub cooldown: Duration,
}

/// Full breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerState {
    /// Current status
    pub status: BreakerStatus,
    /// Failures since the last success (Closed only)
    pub consecutive_failures: u32,
    /// When the circuit last opened
    pub opened_at: Option<Instant>,
    /// Whether the HalfOpen probe slot is taken
    pub probe_in_flight: bool,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self::closed()
    }
}

impl BreakerState {
    /// A fresh, closed breaker
    #[must_use]
    pub const fn closed() -> Self {
        Self {
            status: BreakerStatus::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }

    /// Remaining cooldown at `now`, zero unless the circuit is open
    #[must_use]
    pub fn remaining_cooldown(&self, now: Instant, policy: &BreakerPolicy) -> Duration {
        match (self.status, self.opened_at) {
            (BreakerStatus::Open, Some(opened)) => {
                policy.cooldown.saturating_sub(now.saturating_duration_since(opened))
            }
            _ => Duration::ZERO,
        }
    }
}

/// Inputs to the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerEvent {
    /// A caller wants to make a call
    Request,
    /// An admitted call succeeded
    Success {
        /// Whether the call was the HalfOpen probe
        probe: bool,
    },
    /// An admitted call failed
    Failure {
        /// Whether the call was the HalfOpen probe
        probe: bool,
    },
    /// The probe was dropped before reporting an outcome
    ProbeAbandoned,
}

/// Result of feeding an event to the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Ordinary call admitted
    Admit,
    /// The single HalfOpen trial call admitted
    AdmitProbe,
    /// Call rejected without reaching the dependency
    Reject {
        /// Time until a probe may be admitted (zero while a probe is running)
        retry_after: Duration,
    },
    /// Outcome event accepted
    Recorded,
}

/// Apply `event` to `state` at time `now`
#[must_use]
pub fn transition(
    state: BreakerState,
    event: BreakerEvent,
    now: Instant,
    policy: &BreakerPolicy,
) -> (BreakerState, Decision) {
    let threshold = policy.failure_threshold.max(1);

    match (state.status, event) {
        (BreakerStatus::Closed, BreakerEvent::Request) => (state, Decision::Admit),
        (BreakerStatus::Open, BreakerEvent::Request) => {
            let remaining = state.remaining_cooldown(now, policy);
            if remaining.is_zero() {
                let next = BreakerState {
                    status: BreakerStatus::HalfOpen,
                    probe_in_flight: true,
                    ..state
                };
                (next, Decision::AdmitProbe)
            } else {
                (state, Decision::Reject { retry_after: remaining })
            }
        }
        (BreakerStatus::HalfOpen, BreakerEvent::Request) => {
            if state.probe_in_flight {
                (state, Decision::Reject { retry_after: Duration::ZERO })
            } else {
                let next = BreakerState {
                    probe_in_flight: true,
                    ..state
                };
                (next, Decision::AdmitProbe)
            }
        }

        (BreakerStatus::Closed, BreakerEvent::Success { .. }) => {
            let next = BreakerState {
                consecutive_failures: 0,
                ..state
            };
            (next, Decision::Recorded)
        }
        (BreakerStatus::HalfOpen, BreakerEvent::Success { probe: true }) => {
            (BreakerState::closed(), Decision::Recorded)
        }

        (BreakerStatus::Closed, BreakerEvent::Failure { .. }) => {
            let failures = state.consecutive_failures.saturating_add(1);
            let next = if failures >= threshold {
                BreakerState {
                    status: BreakerStatus::Open,
                    consecutive_failures: failures,
                    opened_at: Some(now),
                    probe_in_flight: false,
                }
            } else {
                BreakerState {
                    consecutive_failures: failures,
                    ..state
                }
            };
            (next, Decision::Recorded)
        }
        (BreakerStatus::HalfOpen, BreakerEvent::Failure { probe: true }) => {
            let next = BreakerState {
                status: BreakerStatus::Open,
                consecutive_failures: 0,
                opened_at: Some(now),
                probe_in_flight: false,
            };
            (next, Decision::Recorded)
        }

        (BreakerStatus::HalfOpen, BreakerEvent::ProbeAbandoned) => {
            let next = BreakerState {
                probe_in_flight: false,
                ..state
            };
            (next, Decision::Recorded)
        }

        // Late outcomes from calls admitted before the circuit tripped
        _ => (state, Decision::Recorded),
    }
}
