//! Resilience integration tests - single-flight, circuit breaker, cache TTL, latency quantiles

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use rand::RngExt;
use tokio::time::Instant;

use rerank_gateway::backend::{Backends, Embedder, Hit, Reranker, VectorSearch};
use rerank_gateway::cache::ResponseCache;
use rerank_gateway::config::{
    CacheConfig, CircuitBreakerConfig, FailsafeConfig, FallbackPolicy, ResolverConfig, RetryConfig,
    TelemetryConfig,
};
use rerank_gateway::failsafe::Failsafe;
use rerank_gateway::fingerprint::Fingerprint;
use rerank_gateway::resolver::{Query, QueryResolver, Source};
use rerank_gateway::telemetry::{LatencySample, LogSketch, MetricAggregator, Outcome};
use rerank_gateway::{Error, Result};

struct Embed;

#[async_trait]
impl Embedder for Embed {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        #[allow(clippy::cast_precision_loss)]
        let len = text.len() as f32;
        Ok(vec![len, 1.0])
    }
}

struct Index;

#[async_trait]
impl VectorSearch for Index {
    async fn search(&self, _vector: &[f32], k: usize) -> Result<Vec<Hit>> {
        Ok((1..=k.min(5))
            .map(|rank| Hit {
                rank,
                id: serde_json::json!(rank),
                score: 1.0 / f64::from(u32::try_from(rank).unwrap_or(u32::MAX)),
                text: format!("passage {rank}"),
                title: None,
                url: None,
                doc_id: None,
                chunk: None,
                reranked: false,
            })
            .collect())
    }
}

/// Reverses the candidates after a delay; can be switched to fail
#[derive(Default)]
struct SlowReranker {
    calls: AtomicU32,
    failing: AtomicBool,
}

#[async_trait]
impl Reranker for SlowReranker {
    async fn rerank(&self, _query: &str, candidates: &[Hit]) -> Result<Vec<Hit>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(80)).await;
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::dependency("rerank", "HTTP 503"));
        }
        Ok(candidates
            .iter()
            .rev()
            .enumerate()
            .map(|(i, hit)| Hit {
                rank: i + 1,
                reranked: true,
                ..hit.clone()
            })
            .collect())
    }
}

fn failsafe_config(threshold: u32) -> FailsafeConfig {
    FailsafeConfig {
        circuit_breaker: CircuitBreakerConfig {
            enabled: true,
            failure_threshold: threshold,
            cooldown: Duration::from_secs(30),
        },
        retry: RetryConfig {
            max_attempts: 1,
            ..RetryConfig::default()
        },
    }
}

fn resolver(reranker: Arc<SlowReranker>, threshold: u32) -> QueryResolver {
    let cache_config = CacheConfig::default();
    let cache = Arc::new(ResponseCache::new(cache_config.max_entries, cache_config.stale_retention));
    let (_aggregator, sink, _rx) = MetricAggregator::new(&TelemetryConfig::default());
    QueryResolver::new(
        Backends {
            embedder: Arc::new(Embed),
            search: Arc::new(Index),
            reranker,
        },
        cache,
        cache_config,
        Failsafe::new("rerank", &failsafe_config(threshold)),
        sink,
        &ResolverConfig {
            fallback: FallbackPolicy::Propagate,
            route: "/rag".to_string(),
        },
        Duration::from_secs(5),
    )
}

fn query(text: &str) -> Query {
    Query {
        text: text.to_string(),
        top_k: 5,
        rerank: true,
    }
}

#[tokio::test(start_paused = true)]
async fn concurrent_identical_misses_share_one_rerank_call() {
    let reranker = Arc::new(SlowReranker::default());
    let resolver = Arc::new(resolver(Arc::clone(&reranker), 5));

    let tasks: Vec<_> = (0..32)
        .map(|i| {
            let resolver = Arc::clone(&resolver);
            // Spacing and case differ; the fingerprint does not
            let text = if i % 2 == 0 { "Circuit Breakers" } else { " circuit   breakers" };
            tokio::spawn(async move {
                resolver
                    .resolve(&query(text), Instant::now() + Duration::from_secs(5))
                    .await
            })
        })
        .collect();

    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.unwrap().unwrap());
    }

    assert_eq!(reranker.calls.load(Ordering::SeqCst), 1);
    let first = &results[0].result;
    assert!(results.iter().all(|r| r.result == *first));
    assert!(results.iter().all(|r| r.source == Source::Upstream));
    assert_eq!(first.hits[0].text, "passage 5");
    assert_eq!(resolver.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn breaker_rejects_sixth_call_without_invoking_dependency() {
    let failsafe = Failsafe::new("rerank", &failsafe_config(5));
    let calls = &AtomicU32::new(0);

    for attempt in 1..=5 {
        let result: Result<()> = failsafe
            .call(None, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::dependency("rerank", "HTTP 503"))
            })
            .await;
        assert!(
            matches!(result, Err(Error::RetriesExhausted { .. })),
            "attempt {attempt}: {result:?}"
        );
    }

    let sixth: Result<()> = failsafe
        .call(None, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
    assert!(matches!(sixth, Err(Error::BreakerOpen { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 5);

    // One trial after the cooldown closes the breaker again
    tokio::time::advance(Duration::from_secs(30)).await;
    let trial: Result<u8> = failsafe
        .call(None, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        })
        .await;
    assert_eq!(trial.unwrap(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 6);
    assert_eq!(failsafe.snapshot().consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn resolver_fails_fast_once_breaker_opens() {
    let reranker = Arc::new(SlowReranker::default());
    reranker.failing.store(true, Ordering::SeqCst);
    let resolver = resolver(Arc::clone(&reranker), 2);
    let deadline = || Instant::now() + Duration::from_secs(5);

    for text in ["a", "b"] {
        assert!(resolver.resolve(&query(text), deadline()).await.is_err());
    }
    let started = Instant::now();
    let err = resolver.resolve(&query("c"), deadline()).await.unwrap_err();
    assert!(matches!(err, Error::BreakerOpen { .. }));
    assert!(started.elapsed() < Duration::from_millis(80));
    assert_eq!(reranker.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn cache_entry_expires_exactly_at_ttl() {
    let cache = ResponseCache::new(16, Duration::from_secs(60));
    let key = Fingerprint::compute("ttl boundary", 10, true);
    let ttl = Duration::from_secs(120);

    cache.put(key.clone(), "value", ttl);

    tokio::time::advance(ttl - Duration::from_millis(1)).await;
    assert_eq!(cache.get(&key), Some("value"));

    tokio::time::advance(Duration::from_millis(2)).await;
    assert_eq!(cache.get(&key), None);
    // Still available to the stale fallback
    assert_eq!(cache.get_stale(&key), Some("value"));
}

#[tokio::test(start_paused = true)]
async fn windowed_p95_stays_within_relative_error() {
    let config = TelemetryConfig {
        relative_error: 0.01,
        ..TelemetryConfig::default()
    };
    let (aggregator, _sink, _rx) = MetricAggregator::new(&config);
    let route: Arc<str> = Arc::from("/rag");

    let mut rng = rand::rng();
    let mut exact = Vec::new();
    let mut sketch = LogSketch::new(0.01);
    // Spread across several time slices
    for _ in 0..20 {
        for _ in 0..500 {
            let ms: u64 = if rng.random_range(0..100) < 5 {
                rng.random_range(400..3000)
            } else {
                rng.random_range(20..300)
            };
            aggregator.ingest(&LatencySample::now(
                Arc::clone(&route),
                Duration::from_millis(ms),
                Outcome::Success,
            ));
            #[allow(clippy::cast_precision_loss)]
            let value = ms as f64;
            exact.push(value);
            sketch.insert(value);
        }
        tokio::time::advance(Duration::from_secs(1)).await;
    }

    exact.sort_by(f64::total_cmp);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    let rank = (0.95 * exact.len() as f64).ceil() as usize;
    let truth = exact[rank - 1];

    let windowed = aggregator.quantile("/rag", 0.95, Duration::from_secs(60)).unwrap();
    let direct = sketch.quantile(0.95).unwrap();
    for estimate in [windowed, direct] {
        let error = (estimate - truth).abs() / truth;
        assert!(error <= 0.01 + 1e-9, "truth={truth} estimate={estimate}");
    }
}
