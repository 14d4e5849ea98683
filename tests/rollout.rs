//! Canary rollout integration tests - staged promotion and threshold rollback

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tokio::sync::broadcast;

use gateway_core::{RollbackReason, RolloutStatus, Verdict};
use rerank_gateway::config::{
    ControlPlaneConfig, MetricSourceConfig, RolloutConfig, RolloutMetric, TelemetryConfig,
};
use rerank_gateway::rollout::{
    DeploymentControlPlane, InProcessSource, LogNotifier, MetricSource, RollbackNotice,
    RolloutController, RolloutNotifier,
};
use rerank_gateway::telemetry::{LatencySample, MetricAggregator, Outcome};
use rerank_gateway::{Error, Result};

fn rollout_config() -> RolloutConfig {
    RolloutConfig {
        release: "reranker-v2".to_string(),
        stages: vec![20, 60, 100],
        bake_time: Duration::from_secs(60),
        analysis_window: Duration::from_secs(30),
        sample_interval: Duration::from_secs(10),
        analysis_timeout: Duration::from_secs(5),
        threshold: 300.0,
        metric: RolloutMetric::LatencyQuantile {
            quantile: 0.95,
            route: "/rag".to_string(),
        },
        max_inconclusive_retries: 3,
        inconclusive_retry_delay: Duration::from_secs(30),
        source: MetricSourceConfig::InProcess,
        control_plane: ControlPlaneConfig::Log,
        notify_webhook: None,
    }
}

/// Control plane that exposes the applied weight to the simulated traffic
#[derive(Clone, Default)]
struct SharedWeightPlane {
    weight: Arc<AtomicU8>,
    rolled_back: Arc<AtomicBool>,
    promoted: Arc<AtomicBool>,
}

#[async_trait]
impl DeploymentControlPlane for SharedWeightPlane {
    async fn set_weight(&self, _stage: usize, percent: u8) -> Result<()> {
        self.weight.store(percent, Ordering::SeqCst);
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        Ok(())
    }

    async fn promote(&self) -> Result<()> {
        self.promoted.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.weight.store(0, Ordering::SeqCst);
        self.rolled_back.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Clone, Default)]
struct CountingNotifier {
    notices: Arc<parking_lot::Mutex<Vec<RollbackNotice>>>,
}

#[async_trait]
impl RolloutNotifier for CountingNotifier {
    async fn notify(&self, notice: &RollbackNotice) -> Result<()> {
        LogNotifier.notify(notice).await?;
        self.notices.lock().push(notice.clone());
        Ok(())
    }
}

/// Metric source reporting a healthy 250ms, except a single 800ms point
/// while the canary serves 60%
struct SpikeAtWeight {
    weight: Arc<AtomicU8>,
    spike_at: u8,
    queries_at_weight: AtomicU32,
}

#[async_trait]
impl MetricSource for SpikeAtWeight {
    async fn query(&self, _metric: &RolloutMetric, _window: Duration) -> Result<f64> {
        if self.weight.load(Ordering::SeqCst) == self.spike_at
            && self.queries_at_weight.fetch_add(1, Ordering::SeqCst) == 1
        {
            return Ok(800.0);
        }
        Ok(250.0)
    }
}

#[tokio::test(start_paused = true)]
async fn healthy_traffic_promotes_through_every_stage() {
    let (aggregator, _sink, _rx) = MetricAggregator::new(&TelemetryConfig::default());
    let plane = SharedWeightPlane::default();
    let notifier = CountingNotifier::default();
    let controller = RolloutController::new(
        rollout_config(),
        Box::new(InProcessSource::new(Arc::clone(&aggregator))),
        Box::new(plane.clone()),
        Box::new(notifier.clone()),
    )
    .unwrap();

    // Simulated request stream, every latency at or below 250ms
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let traffic = {
        let aggregator = Arc::clone(&aggregator);
        let route: Arc<str> = Arc::from("/rag");
        let mut stop = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut tick = 0u64;
            loop {
                tokio::select! {
                    () = tokio::time::sleep(Duration::from_millis(250)) => {
                        tick += 1;
                        let ms = 120 + (tick * 37) % 131;
                        aggregator.ingest(&LatencySample::now(
                            Arc::clone(&route),
                            Duration::from_millis(ms),
                            Outcome::Success,
                        ));
                    }
                    _ = stop.recv() => break,
                }
            }
        })
    };

    let report = controller.run(shutdown_rx).await.unwrap();
    shutdown_tx.send(()).unwrap();
    traffic.await.unwrap();

    assert_eq!(report.status, RolloutStatus::Promoted);
    assert!(report.outcome().is_ok());
    assert_eq!(
        report.stages.iter().map(|s| s.weight).collect::<Vec<_>>(),
        vec![20, 60, 100]
    );
    assert!(report.stages.iter().all(|s| s.verdict == Some(Verdict::Pass)));
    for run in &report.analyses {
        let value = run.metric_value.unwrap();
        assert!(value <= 250.0 * 1.01, "stage {} p95 {value}", run.stage);
    }
    assert!(plane.promoted.load(Ordering::SeqCst));
    assert_eq!(plane.weight.load(Ordering::SeqCst), 100);
    assert!(notifier.notices.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn spike_at_sixty_percent_rolls_back_to_zero() {
    let plane = SharedWeightPlane::default();
    let notifier = CountingNotifier::default();
    let source = SpikeAtWeight {
        weight: Arc::clone(&plane.weight),
        spike_at: 60,
        queries_at_weight: AtomicU32::new(0),
    };
    let controller = RolloutController::new(
        rollout_config(),
        Box::new(source),
        Box::new(plane.clone()),
        Box::new(notifier.clone()),
    )
    .unwrap();

    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let report = controller.run(shutdown_rx).await.unwrap();

    assert_eq!(report.status, RolloutStatus::RolledBack);
    assert_eq!(report.weight, 0);
    assert_eq!(report.rollback_reason, Some(RollbackReason::ThresholdBreached));
    assert_eq!(
        report.stages.iter().map(|s| s.weight).collect::<Vec<_>>(),
        vec![20, 60]
    );
    assert!(plane.rolled_back.load(Ordering::SeqCst));
    assert!(!plane.promoted.load(Ordering::SeqCst));
    assert_eq!(plane.weight.load(Ordering::SeqCst), 0);

    let notices = notifier.notices.lock();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].weight, 60);
    assert_eq!(notices[0].metric_value, Some(800.0));
    assert!(matches!(
        report.outcome(),
        Err(Error::AnalysisFail { value, threshold, .. }) if value == 800.0 && threshold == 300.0
    ));
}

#[tokio::test(start_paused = true)]
async fn no_traffic_fails_closed_after_retries() {
    let (aggregator, _sink, _rx) = MetricAggregator::new(&TelemetryConfig::default());
    let plane = SharedWeightPlane::default();
    let controller = RolloutController::new(
        rollout_config(),
        Box::new(InProcessSource::new(aggregator)),
        Box::new(plane.clone()),
        Box::new(CountingNotifier::default()),
    )
    .unwrap();

    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let report = controller.run(shutdown_rx).await.unwrap();

    assert_eq!(report.rollback_reason, Some(RollbackReason::InconclusiveExhausted));
    // First run plus three retries
    assert_eq!(report.analyses.len(), 4);
    assert_eq!(plane.weight.load(Ordering::SeqCst), 0);
}

/// Control plane that applies weights but refuses to roll back
#[derive(Clone, Default)]
struct StuckPlane {
    rollback_attempts: Arc<AtomicU32>,
}

#[async_trait]
impl DeploymentControlPlane for StuckPlane {
    async fn set_weight(&self, _stage: usize, _percent: u8) -> Result<()> {
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        Ok(())
    }

    async fn promote(&self) -> Result<()> {
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.rollback_attempts.fetch_add(1, Ordering::SeqCst);
        Err(Error::ControlPlane("503".to_string()))
    }
}

struct AlwaysSlow;

#[async_trait]
impl MetricSource for AlwaysSlow {
    async fn query(&self, _metric: &RolloutMetric, _window: Duration) -> Result<f64> {
        Ok(800.0)
    }
}

#[tokio::test(start_paused = true)]
async fn breach_is_reported_even_when_rollback_is_refused() {
    let plane = StuckPlane::default();
    let notifier = CountingNotifier::default();
    let controller = RolloutController::new(
        rollout_config(),
        Box::new(AlwaysSlow),
        Box::new(plane.clone()),
        Box::new(notifier.clone()),
    )
    .unwrap();

    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let result = controller.run(shutdown_rx).await;

    assert!(matches!(result, Err(Error::ControlPlane(_))));
    assert!(plane.rollback_attempts.load(Ordering::SeqCst) >= 1);

    let snapshot = controller.snapshot();
    assert_eq!(snapshot.status, RolloutStatus::RolledBack);
    assert_eq!(snapshot.rollback_reason, Some(RollbackReason::ThresholdBreached));

    let notices = notifier.notices.lock();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].reason, RollbackReason::ThresholdBreached);
    assert_eq!(notices[0].metric_value, Some(800.0));
    assert_eq!(notices[0].rollback_error.as_deref(), Some("Control plane error: 503"));
}
