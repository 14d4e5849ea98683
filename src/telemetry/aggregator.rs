//! Rolling-window metric aggregation
//!
//! The resolver hands [`LatencySample`]s to a [`SampleSink`], which never
//! blocks: when the bounded channel is full the sample is dropped and counted.
//! A single consumer task folds samples into per-route time slices, each
//! holding a [`LogSketch`] of request latency plus cache hit/miss counts.
//! Queries merge the slices that fall inside the requested window.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info};

use super::sketch::LogSketch;
use crate::config::TelemetryConfig;

/// What happened to one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Resolved upstream
    Success,
    /// Failed (possibly answered by the stale fallback)
    Failure,
    /// Refused by an open circuit without calling the dependency
    Rejected,
    /// Answered from a fresh cache entry
    CacheHit,
    /// No fresh cache entry; an upstream resolution follows
    CacheMiss,
}

impl Outcome {
    /// Whether the sample's duration is a request latency
    #[must_use]
    pub fn is_latency(self) -> bool {
        !matches!(self, Self::CacheMiss | Self::Rejected)
    }
}

/// One observation emitted by the resolver
#[derive(Debug, Clone)]
pub struct LatencySample {
    /// When the request finished
    pub at: Instant,
    /// Route label
    pub route: Arc<str>,
    /// Time spent serving the request
    pub duration: Duration,
    /// Outcome
    pub outcome: Outcome,
}

impl LatencySample {
    /// Sample stamped with the current time
    #[must_use]
    pub fn now(route: Arc<str>, duration: Duration, outcome: Outcome) -> Self {
        Self {
            at: Instant::now(),
            route,
            duration,
            outcome,
        }
    }
}

/// Non-blocking producer side of the sample stream
#[derive(Clone)]
pub struct SampleSink {
    tx: mpsc::Sender<LatencySample>,
    dropped: Arc<AtomicU64>,
}

impl SampleSink {
    /// Hand a sample to the aggregator; drops it if the buffer is full
    pub fn emit(&self, sample: LatencySample) {
        if let Err(e) = self.tx.try_send(sample) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped.is_power_of_two() {
                debug!(dropped, error = %e, "Metric sample dropped");
            }
        }
    }

    /// Samples dropped so far
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

struct Slice {
    epoch: u64,
    latency: LogSketch,
    hits: u64,
    misses: u64,
}

#[derive(Default)]
struct RouteWindow {
    slices: VecDeque<Slice>,
}

/// Per-route rolling quantile and hit-rate estimates
pub struct MetricAggregator {
    routes: DashMap<Arc<str>, RouteWindow>,
    origin: Instant,
    slice_width: Duration,
    max_slices: u64,
    relative_error: f64,
    ingested: AtomicU64,
    dropped: Arc<AtomicU64>,
}

/// Aggregator counters for `/health`
#[derive(Debug, Clone, Serialize)]
pub struct AggregatorStats {
    /// Samples folded into the windows
    pub ingested: u64,
    /// Samples dropped at the hand-off
    pub dropped: u64,
    /// Routes with data
    pub routes: usize,
}

impl MetricAggregator {
    /// Create an aggregator and the sink/receiver pair feeding it
    #[must_use]
    pub fn new(config: &TelemetryConfig) -> (Arc<Self>, SampleSink, mpsc::Receiver<LatencySample>) {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let slice_width = if config.slice_width.is_zero() {
            Duration::from_secs(1)
        } else {
            config.slice_width
        };
        let max_slices = div_ceil(config.max_window, slice_width).max(1);

        let aggregator = Arc::new(Self {
            routes: DashMap::new(),
            origin: Instant::now(),
            slice_width,
            max_slices,
            relative_error: config.relative_error,
            ingested: AtomicU64::new(0),
            dropped: Arc::clone(&dropped),
        });
        let sink = SampleSink { tx, dropped };
        (aggregator, sink, rx)
    }

    /// Consume samples until the channel closes or shutdown is signalled
    pub async fn run(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<LatencySample>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                sample = rx.recv() => match sample {
                    Some(sample) => self.ingest(&sample),
                    None => break,
                },
                _ = shutdown_rx.recv() => {
                    // Fold whatever is already buffered
                    while let Ok(sample) = rx.try_recv() {
                        self.ingest(&sample);
                    }
                    break;
                }
            }
        }
        info!(ingested = self.ingested.load(Ordering::Relaxed), "Metric aggregator stopped");
    }

    /// Fold one sample into its route window
    pub fn ingest(&self, sample: &LatencySample) {
        let epoch = self.epoch(sample.at);
        let mut window = self.routes.entry(Arc::clone(&sample.route)).or_default();

        let position = window.slices.iter().rposition(|s| s.epoch <= epoch);
        let slice = match position {
            Some(i) if window.slices[i].epoch == epoch => &mut window.slices[i],
            _ => {
                let insert_at = position.map_or(0, |i| i + 1);
                window.slices.insert(
                    insert_at,
                    Slice {
                        epoch,
                        latency: LogSketch::new(self.relative_error),
                        hits: 0,
                        misses: 0,
                    },
                );
                &mut window.slices[insert_at]
            }
        };

        match sample.outcome {
            Outcome::CacheHit => slice.hits += 1,
            Outcome::CacheMiss => slice.misses += 1,
            Outcome::Success | Outcome::Failure | Outcome::Rejected => {}
        }
        if sample.outcome.is_latency() {
            slice.latency.insert(sample.duration.as_secs_f64() * 1000.0);
        }

        // Retain only what the longest window can ask for
        let newest = window.slices.back().map_or(epoch, |s| s.epoch);
        let floor = newest.saturating_sub(self.max_slices - 1);
        while window.slices.front().is_some_and(|s| s.epoch < floor) {
            window.slices.pop_front();
        }

        self.ingested.fetch_add(1, Ordering::Relaxed);
    }

    /// Latency in milliseconds at quantile `q` over the trailing `window`
    ///
    /// `None` when the window holds no latency samples.
    #[must_use]
    pub fn quantile(&self, route: &str, q: f64, window: Duration) -> Option<f64> {
        let mut merged = LogSketch::new(self.relative_error);
        self.for_each_slice(route, window, |slice| merged.merge(&slice.latency));
        merged.quantile(q)
    }

    /// Cache hit rate over the trailing `window`, `None` without lookups
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self, route: &str, window: Duration) -> Option<f64> {
        let (mut hits, mut misses) = (0u64, 0u64);
        self.for_each_slice(route, window, |slice| {
            hits += slice.hits;
            misses += slice.misses;
        });
        let total = hits + misses;
        (total > 0).then(|| hits as f64 / total as f64)
    }

    /// Counters for health reporting
    #[must_use]
    pub fn stats(&self) -> AggregatorStats {
        AggregatorStats {
            ingested: self.ingested.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            routes: self.routes.len(),
        }
    }

    fn for_each_slice(&self, route: &str, window: Duration, mut f: impl FnMut(&Slice)) {
        let Some(route_window) = self.routes.get(route) else {
            return;
        };
        let now = self.epoch(Instant::now());
        let span = div_ceil(window, self.slice_width).clamp(1, self.max_slices);
        let floor = now.saturating_sub(span - 1);
        route_window
            .slices
            .iter()
            .filter(|s| s.epoch >= floor && s.epoch <= now)
            .for_each(|s| f(s));
    }

    #[allow(clippy::cast_possible_truncation)]
    fn epoch(&self, at: Instant) -> u64 {
        let since = at.saturating_duration_since(self.origin).as_nanos();
        (since / self.slice_width.as_nanos().max(1)) as u64
    }
}

fn div_ceil(value: Duration, unit: Duration) -> u64 {
    let unit = unit.as_nanos().max(1);
    u64::try_from(value.as_nanos().div_ceil(unit)).unwrap_or(u64::MAX)
}
