//! Rerank Gateway Library
//!
//! Query gateway in front of a vector search index and a rerank model.
//!
//! # Features
//!
//! - **Result cache**: fingerprinted, TTL-bound, with a stale fallback
//! - **Single-flight**: concurrent identical misses share one upstream call
//! - **Failsafes**: circuit breaker plus jittered exponential retry on rerank
//! - **Telemetry**: rolling p95/p99 per route, Prometheus exposition
//! - **Canary rollouts**: staged traffic shifts gated on a latency or hit-rate
//!   threshold, with automatic rollback

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod failsafe;
pub mod fingerprint;
pub mod gateway;
pub mod resolver;
pub mod rollout;
pub mod telemetry;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
