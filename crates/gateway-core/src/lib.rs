//! Rerank gateway core
//!
//! I/O-free state machines shared by the gateway binary:
//!
//! - [`breaker`]: circuit breaker states and their transition function
//! - [`rollout`]: progressive-delivery stage sequencing
//! - [`analysis`]: threshold verdicts over sampled metric points
//!
//! Nothing in this crate reads a clock, sleeps, or touches the network. Callers
//! pass `now` in and execute the returned decisions/directives themselves, so
//! every transition is unit-testable with plain values.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod analysis;
pub mod breaker;
pub mod rollout;

pub use analysis::{judge, worst_point, Comparison, Verdict};
pub use breaker::{transition as breaker_transition, BreakerEvent, BreakerPolicy, BreakerState, BreakerStatus, Decision};
pub use rollout::{
    transition as rollout_transition,
    Directive, PlanError, RollbackReason, RolloutEvent, RolloutPlan, RolloutState, RolloutStatus,
    TransitionError,
};
