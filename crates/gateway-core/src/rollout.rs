//! Progressive-delivery stage sequencing
//!
//! A rollout walks an ordered list of traffic weights. Each stage is applied,
//! baked, then analyzed:
//!
//! ```text
//! Pending --Begin--> Paused(w0) --BakeElapsed--> Analyzing
//!   Analyzing --Pass--> Paused(w_next) ... --Pass at 100--> Promoted
//!   Analyzing --Fail--> RolledBack (weight 0)
//!   Analyzing --Inconclusive--> Analyzing (retry) ... exhausted --> RolledBack
//! ```
//!
//! [`transition`] is pure: it returns the next state and the [`Directive`]s
//! the controller must execute, in order.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analysis::Verdict;

/// Rollout status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStatus {
    /// Not started
    Pending,
    /// Weight applied, baking
    Paused,
    /// Evaluating metrics for the current stage
    Analyzing,
    /// Final stage passed (terminal)
    Promoted,
    /// Rolled back to weight 0 (terminal)
    RolledBack,
}

impl RolloutStatus {
    /// Whether no further events are accepted
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Promoted | Self::RolledBack)
    }
}

impl std::fmt::Display for RolloutStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Paused => "paused",
            Self::Analyzing => "analyzing",
            Self::Promoted => "promoted",
            Self::RolledBack => "rolled_back",
        };
        f.write_str(s)
    }
}

/// Invalid stage plan
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    /// No stages configured
    #[error("rollout plan has no stages")]
    Empty,
    /// A weight outside 1..=100
    #[error("stage weight {0} is outside 1..=100")]
    WeightOutOfRange(u8),
    /// Weights must strictly increase
    #[error("stage weights must strictly increase ({previous} then {next})")]
    NotIncreasing {
        /// Earlier weight
        previous: u8,
        /// Following weight
        next: u8,
    },
    /// The last stage must carry all traffic
    #[error("final stage weight must be 100, got {0}")]
    DoesNotReachFull(u8),
}

/// Validated stage weights plus the inconclusive retry budget
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RolloutPlan {
    stages: Vec<u8>,
    max_inconclusive_retries: u32,
}

impl RolloutPlan {
    /// Validate and build a plan
    pub fn new(stages: Vec<u8>, max_inconclusive_retries: u32) -> Result<Self, PlanError> {
        let Some(&last) = stages.last() else {
            return Err(PlanError::Empty);
        };
        if let Some(&bad) = stages.iter().find(|w| !(1..=100).contains(*w)) {
            return Err(PlanError::WeightOutOfRange(bad));
        }
        if let Some(pair) = stages.windows(2).find(|pair| pair[0] >= pair[1]) {
            return Err(PlanError::NotIncreasing {
                previous: pair[0],
                next: pair[1],
            });
        }
        if last != 100 {
            return Err(PlanError::DoesNotReachFull(last));
        }

        Ok(Self {
            stages,
            max_inconclusive_retries,
        })
    }

    /// Stage weights in order
    #[must_use]
    pub fn stages(&self) -> &[u8] {
        &self.stages
    }

    /// Inconclusive analyses tolerated per stage before failing closed
    #[must_use]
    pub fn max_inconclusive_retries(&self) -> u32 {
        self.max_inconclusive_retries
    }
}

/// Why a rollout was rolled back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackReason {
    /// The metric breached the threshold
    ThresholdBreached,
    /// The metric stayed unavailable past the retry budget
    InconclusiveExhausted,
    /// A traffic command failed mid-rollout
    ControlPlaneFailure,
}

/// Inputs to the rollout machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloutEvent {
    /// Start the sequence
    Begin,
    /// The bake time for the current stage elapsed
    BakeElapsed,
    /// An analysis run finished
    AnalysisCompleted(Verdict),
}

/// Side effects requested by a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// Route `percent` of traffic to the canary
    SetWeight {
        /// Zero-based stage index
        stage: usize,
        /// Traffic percentage
        percent: u8,
    },
    /// Hold the rollout at its current weight
    Pause,
    /// Wait the bake time, then send [`RolloutEvent::BakeElapsed`]
    Bake,
    /// Run an analysis, then send [`RolloutEvent::AnalysisCompleted`]
    Analyze,
    /// Wait the inconclusive retry delay, then analyze again
    ReanalyzeAfterDelay,
    /// Make the canary the stable release
    Promote,
    /// Send all traffic back to stable and notify an operator
    Rollback(RollbackReason),
}

/// Event not valid in the current state
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("event {event:?} is not valid while {status}")]
pub struct TransitionError {
    /// Status at the time
    pub status: RolloutStatus,
    /// Rejected event
    pub event: RolloutEvent,
}

/// Rollout position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RolloutState {
    /// Current status
    pub status: RolloutStatus,
    /// Zero-based index into the plan's stages
    pub stage_index: usize,
    /// Traffic weight currently applied
    pub weight: u8,
    /// Inconclusive analyses seen at the current stage
    pub inconclusive_attempts: u32,
}

impl Default for RolloutState {
    fn default() -> Self {
        Self::pending()
    }
}

impl RolloutState {
    /// Not yet started
    #[must_use]
    pub const fn pending() -> Self {
        Self {
            status: RolloutStatus::Pending,
            stage_index: 0,
            weight: 0,
            inconclusive_attempts: 0,
        }
    }

    fn enter_stage(index: usize, plan: &RolloutPlan) -> (Self, Vec<Directive>) {
        let percent = plan.stages[index];
        let next = Self {
            status: RolloutStatus::Paused,
            stage_index: index,
            weight: percent,
            inconclusive_attempts: 0,
        };
        let directives = vec![
            Directive::SetWeight {
                stage: index,
                percent,
            },
            Directive::Pause,
            Directive::Bake,
        ];
        (next, directives)
    }

    fn rolled_back(self, reason: RollbackReason) -> (Self, Vec<Directive>) {
        let next = Self {
            status: RolloutStatus::RolledBack,
            weight: 0,
            ..self
        };
        (next, vec![Directive::Rollback(reason)])
    }
}

/// Apply `event` to `state` under `plan`
pub fn transition(
    state: &RolloutState,
    event: RolloutEvent,
    plan: &RolloutPlan,
) -> Result<(RolloutState, Vec<Directive>), TransitionError> {
    let invalid = || TransitionError {
        status: state.status,
        event,
    };

    match (state.status, event) {
        (RolloutStatus::Pending, RolloutEvent::Begin) => Ok(RolloutState::enter_stage(0, plan)),

        (RolloutStatus::Paused, RolloutEvent::BakeElapsed) => {
            let next = RolloutState {
                status: RolloutStatus::Analyzing,
                ..*state
            };
            Ok((next, vec![Directive::Analyze]))
        }

        (RolloutStatus::Analyzing, RolloutEvent::AnalysisCompleted(verdict)) => match verdict {
            Verdict::Pass => {
                let next_index = state.stage_index + 1;
                if next_index < plan.stages.len() {
                    Ok(RolloutState::enter_stage(next_index, plan))
                } else {
                    let next = RolloutState {
                        status: RolloutStatus::Promoted,
                        ..*state
                    };
                    Ok((next, vec![Directive::Promote]))
                }
            }
            Verdict::Fail => Ok(state.rolled_back(RollbackReason::ThresholdBreached)),
            Verdict::Inconclusive => {
                let attempts = state.inconclusive_attempts + 1;
                if attempts > plan.max_inconclusive_retries {
                    Ok(state.rolled_back(RollbackReason::InconclusiveExhausted))
                } else {
                    let next = RolloutState {
                        inconclusive_attempts: attempts,
                        ..*state
                    };
                    Ok((next, vec![Directive::ReanalyzeAfterDelay]))
                }
            }
        },

        _ => Err(invalid()),
    }
}
