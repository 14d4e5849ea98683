//! Latency telemetry: in-process aggregation and Prometheus export

pub mod aggregator;
pub mod exporter;
pub mod sketch;

pub use aggregator::{AggregatorStats, LatencySample, MetricAggregator, Outcome, SampleSink};
pub use exporter::InflightGuard;
pub use sketch::LogSketch;
