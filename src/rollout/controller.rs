//! Progressive delivery control loop
//!
//! Feeds events into [`gateway_core::rollout_transition`] and executes the
//! directives it returns: traffic commands go to the control plane, bakes and
//! retry delays become timers, analyses sample the metric source. At most one
//! rollout runs per controller.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use gateway_core::{
    Directive, RollbackReason, RolloutEvent, RolloutPlan, RolloutState, RolloutStatus, Verdict,
    judge, rollout_transition, worst_point,
};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use super::control_plane::DeploymentControlPlane;
use super::notifier::{RollbackNotice, RolloutNotifier};
use super::source::MetricSource;
use crate::config::RolloutConfig;
use crate::{Error, Result};

/// One stage as it was entered
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageRecord {
    /// Zero-based stage index
    pub stage: usize,
    /// Traffic weight applied
    pub weight: u8,
    /// When the weight was applied
    pub started_at: DateTime<Utc>,
    /// Verdict of the last analysis at this stage
    pub verdict: Option<Verdict>,
}

/// One analysis run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisRun {
    /// Zero-based stage index
    pub stage: usize,
    /// Least healthy point observed
    pub metric_value: Option<f64>,
    /// Threshold gated on
    pub threshold: f64,
    /// Outcome
    pub verdict: Verdict,
    /// Sampled points, `None` where the source had no value
    pub points: Vec<Option<f64>>,
    /// When the run finished
    pub evaluated_at: DateTime<Utc>,
}

/// Observable rollout progress, served on `GET /rollout`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RolloutSnapshot {
    /// Identifies one run of the controller
    pub run_id: Uuid,
    /// Release identifier
    pub release: String,
    /// Metric gated on
    pub metric: String,
    /// Current status
    pub status: RolloutStatus,
    /// Zero-based stage index
    pub stage_index: usize,
    /// Weight currently applied
    pub weight: u8,
    /// Why the rollout was rolled back, if it was
    pub rollback_reason: Option<RollbackReason>,
    /// Stages entered so far
    pub stages: Vec<StageRecord>,
    /// Analysis history
    pub analyses: Vec<AnalysisRun>,
}

impl RolloutSnapshot {
    fn pending(release: &str, metric: String) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            release: release.to_string(),
            metric,
            status: RolloutStatus::Pending,
            stage_index: 0,
            weight: 0,
            rollback_reason: None,
            stages: Vec::new(),
            analyses: Vec::new(),
        }
    }

    /// `Ok` when promoted, otherwise the error that ended the rollout
    pub fn outcome(&self) -> Result<()> {
        match (self.status, self.rollback_reason) {
            (RolloutStatus::Promoted, _) => Ok(()),
            (RolloutStatus::RolledBack, Some(RollbackReason::ThresholdBreached)) => {
                let last = self.analyses.last();
                Err(Error::AnalysisFail {
                    metric: self.metric.clone(),
                    value: last.and_then(|a| a.metric_value).unwrap_or(f64::NAN),
                    threshold: last.map_or(f64::NAN, |a| a.threshold),
                })
            }
            (RolloutStatus::RolledBack, Some(RollbackReason::InconclusiveExhausted)) => {
                Err(Error::MetricUnavailable(format!(
                    "{} stayed unavailable past the retry budget",
                    self.metric
                )))
            }
            (RolloutStatus::RolledBack, Some(RollbackReason::ControlPlaneFailure)) => Err(
                Error::ControlPlane(format!("rollout of {} aborted", self.release)),
            ),
            (status, _) => Err(Error::Internal(format!("rollout ended while {status}"))),
        }
    }
}

/// Runs canary rollouts against a metric source and control plane
pub struct RolloutController {
    config: RolloutConfig,
    plan: RolloutPlan,
    source: Box<dyn MetricSource>,
    plane: Box<dyn DeploymentControlPlane>,
    notifier: Box<dyn RolloutNotifier>,
    active: AtomicBool,
    snapshot: RwLock<RolloutSnapshot>,
}

struct ActiveGuard<'a>(&'a AtomicBool);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RolloutController {
    /// Create a controller
    pub fn new(
        config: RolloutConfig,
        source: Box<dyn MetricSource>,
        plane: Box<dyn DeploymentControlPlane>,
        notifier: Box<dyn RolloutNotifier>,
    ) -> Result<Self> {
        let plan = config.plan()?;
        let snapshot = RolloutSnapshot::pending(&config.release, config.metric.name());
        Ok(Self {
            config,
            plan,
            source,
            plane,
            notifier,
            active: AtomicBool::new(false),
            snapshot: RwLock::new(snapshot),
        })
    }

    /// Current progress
    pub fn snapshot(&self) -> RolloutSnapshot {
        self.snapshot.read().clone()
    }

    /// Whether a rollout is running
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Drive one rollout to a terminal state
    ///
    /// Returns the final snapshot; inspect [`RolloutSnapshot::outcome`] for
    /// promotion versus rollback.
    ///
    /// # Errors
    ///
    /// - [`Error::RolloutInProgress`] if a rollout is already running
    /// - [`Error::ControlPlane`] if a traffic command fails (a rollback is
    ///   attempted and reported first)
    /// - [`Error::Shutdown`] if `shutdown` fires (the rollout is paused first)
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<RolloutSnapshot> {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::RolloutInProgress(self.config.release.clone()));
        }
        let _guard = ActiveGuard(&self.active);

        let snapshot = RolloutSnapshot::pending(&self.config.release, self.config.metric.name());
        let run_id = snapshot.run_id;
        *self.snapshot.write() = snapshot;
        info!(
            %run_id,
            release = %self.config.release,
            stages = ?self.plan.stages(),
            metric = %self.config.metric.name(),
            threshold = self.config.threshold,
            "Starting rollout"
        );

        match self.drive(&mut shutdown).await {
            Ok(()) => Ok(self.snapshot()),
            Err(Error::Shutdown) => {
                warn!(release = %self.config.release, "Shutdown during rollout, pausing");
                if let Err(e) = self.plane.pause().await {
                    warn!(error = %e, "Failed to pause rollout on shutdown");
                }
                Err(Error::Shutdown)
            }
            Err(e) => {
                warn!(release = %self.config.release, error = %e, "Rollout aborted, rolling back");
                let rollback_error = match self.plane.rollback().await {
                    Ok(()) => None,
                    Err(rollback) => {
                        warn!(error = %rollback, "Best-effort rollback failed");
                        Some(rollback.to_string())
                    }
                };
                let (stage, reported) = {
                    let mut snapshot = self.snapshot.write();
                    snapshot.status = RolloutStatus::RolledBack;
                    snapshot.weight = 0;
                    let reported = snapshot.rollback_reason.is_some();
                    if !reported {
                        snapshot.rollback_reason = Some(RollbackReason::ControlPlaneFailure);
                    }
                    (snapshot.stage_index, reported)
                };
                // A rollback directive that failed has already been reported
                if !reported {
                    let cause = rollback_error.unwrap_or_else(|| e.to_string());
                    self.notify_rollback(stage, RollbackReason::ControlPlaneFailure, Some(cause))
                        .await;
                }
                Err(e)
            }
        }
    }

    async fn drive(&self, shutdown: &mut broadcast::Receiver<()>) -> Result<()> {
        let mut state = RolloutState::pending();
        let mut queue = VecDeque::new();
        self.step(&mut state, RolloutEvent::Begin, &mut queue)?;

        while let Some(directive) = queue.pop_front() {
            let event = self.execute(directive, &state, shutdown).await?;
            if let Some(event) = event {
                self.step(&mut state, event, &mut queue)?;
            }
        }

        info!(
            release = %self.config.release,
            status = %state.status,
            weight = state.weight,
            "Rollout finished"
        );
        Ok(())
    }

    fn step(
        &self,
        state: &mut RolloutState,
        event: RolloutEvent,
        queue: &mut VecDeque<Directive>,
    ) -> Result<()> {
        let (next, directives) = rollout_transition(state, event, &self.plan)
            .map_err(|e| Error::Internal(e.to_string()))?;
        *state = next;
        queue.extend(directives);

        let mut snapshot = self.snapshot.write();
        snapshot.status = next.status;
        snapshot.stage_index = next.stage_index;
        snapshot.weight = next.weight;
        Ok(())
    }

    async fn execute(
        &self,
        directive: Directive,
        state: &RolloutState,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<Option<RolloutEvent>> {
        match directive {
            Directive::SetWeight { stage, percent } => {
                info!(stage, weight = percent, "Setting canary weight");
                self.plane.set_weight(stage, percent).await?;
                self.snapshot.write().stages.push(StageRecord {
                    stage,
                    weight: percent,
                    started_at: Utc::now(),
                    verdict: None,
                });
                Ok(None)
            }
            Directive::Pause => {
                self.plane.pause().await?;
                Ok(None)
            }
            Directive::Bake => {
                info!(stage = state.stage_index, bake = ?self.config.bake_time, "Baking");
                sleep(self.config.bake_time, shutdown).await?;
                Ok(Some(RolloutEvent::BakeElapsed))
            }
            Directive::Analyze => {
                let verdict = self.analyze(state.stage_index, shutdown).await?;
                Ok(Some(RolloutEvent::AnalysisCompleted(verdict)))
            }
            Directive::ReanalyzeAfterDelay => {
                info!(
                    stage = state.stage_index,
                    attempt = state.inconclusive_attempts,
                    delay = ?self.config.inconclusive_retry_delay,
                    "Analysis inconclusive, retrying"
                );
                sleep(self.config.inconclusive_retry_delay, shutdown).await?;
                let verdict = self.analyze(state.stage_index, shutdown).await?;
                Ok(Some(RolloutEvent::AnalysisCompleted(verdict)))
            }
            Directive::Promote => {
                self.plane.promote().await?;
                info!(release = %self.config.release, "Canary promoted");
                Ok(None)
            }
            Directive::Rollback(reason) => {
                self.snapshot.write().rollback_reason = Some(reason);
                let result = self.plane.rollback().await;
                let rollback_error = result.as_ref().err().map(ToString::to_string);
                self.notify_rollback(state.stage_index, reason, rollback_error).await;
                result.map(|()| None)
            }
        }
    }

    /// Sample the metric across the analysis window and judge the points
    async fn analyze(&self, stage: usize, shutdown: &mut broadcast::Receiver<()>) -> Result<Verdict> {
        let config = &self.config;
        let comparison = config.metric.comparison();
        let samples = sample_count(config.analysis_window, config.sample_interval);
        let mut points = Vec::with_capacity(samples);

        for i in 0..samples {
            if i > 0 {
                sleep(config.sample_interval, shutdown).await?;
            }
            let point = match tokio::time::timeout(
                config.analysis_timeout,
                self.source.query(&config.metric, config.analysis_window),
            )
            .await
            {
                Ok(Ok(value)) => Some(value),
                Ok(Err(e)) => {
                    warn!(stage, sample = i, error = %e, "Metric sample unavailable");
                    None
                }
                Err(_) => {
                    warn!(stage, sample = i, timeout = ?config.analysis_timeout, "Metric query timed out");
                    None
                }
            };
            points.push(point);

            if point.is_some_and(|v| comparison.breaches(v, config.threshold)) {
                break;
            }
        }

        let verdict = judge(&points, config.threshold, comparison);
        let metric_value = worst_point(&points, comparison);
        info!(
            stage,
            verdict = %verdict,
            value = ?metric_value,
            threshold = config.threshold,
            samples = points.len(),
            "Analysis complete"
        );

        let mut snapshot = self.snapshot.write();
        if let Some(record) = snapshot.stages.iter_mut().rev().find(|r| r.stage == stage) {
            record.verdict = Some(verdict);
        }
        snapshot.analyses.push(AnalysisRun {
            stage,
            metric_value,
            threshold: config.threshold,
            verdict,
            points,
            evaluated_at: Utc::now(),
        });
        Ok(verdict)
    }

    async fn notify_rollback(
        &self,
        stage: usize,
        reason: RollbackReason,
        rollback_error: Option<String>,
    ) {
        let (run_id, weight, metric_value) = {
            let snapshot = self.snapshot.read();
            let weight = snapshot
                .stages
                .iter()
                .rev()
                .find(|r| r.stage == stage)
                .map_or(0, |r| r.weight);
            (snapshot.run_id, weight, snapshot.analyses.last().and_then(|a| a.metric_value))
        };
        let notice = RollbackNotice {
            run_id,
            release: self.config.release.clone(),
            stage,
            weight,
            reason,
            metric_value,
            threshold: self.config.threshold,
            metric: self.config.metric.name(),
            rollback_error,
            at: Utc::now(),
        };
        if let Err(e) = self.notifier.notify(&notice).await {
            warn!(error = %e, "Failed to deliver rollback notice");
        }
    }
}

/// Points per analysis: one per `interval` across `window`, at least one
fn sample_count(window: Duration, interval: Duration) -> usize {
    if interval.is_zero() {
        return 1;
    }
    let count = window.as_nanos().div_ceil(interval.as_nanos());
    usize::try_from(count).unwrap_or(usize::MAX).max(1)
}

async fn sleep(duration: Duration, shutdown: &mut broadcast::Receiver<()>) -> Result<()> {
    tokio::select! {
        () = tokio::time::sleep(duration) => Ok(()),
        Ok(()) = shutdown.recv() => Err(Error::Shutdown),
    }
}
