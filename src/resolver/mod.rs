//! Query resolution
//!
//! ```text
//! fingerprint -> cache hit?  --yes--> CacheHit sample, return
//!                  | no
//!                  v
//!             CacheMiss sample -> single-flight(fingerprint) {
//!                 embed -> vector search (backoff) -> rerank via breaker/backoff -> cache put
//!             }
//!                  | ok                     | err
//!                  v                        v
//!           Success sample          Failure/Rejected sample -> stale fallback or error
//! ```
//!
//! Fingerprints include the index version; [`QueryResolver::bump_index_version`]
//! makes every earlier cache entry unreachable after a re-index.

pub mod single_flight;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{Backends, RerankResult};
use crate::cache::ResponseCache;
use crate::config::{CacheConfig, FallbackPolicy, ResolverConfig, RetryConfig};
use crate::failsafe::Failsafe;
use crate::fingerprint::Fingerprint;
use crate::telemetry::{LatencySample, Outcome, SampleSink, exporter};
use crate::{Error, Result};

pub use single_flight::{Role, SingleFlight};

/// Shared cache of rerank results
pub type RerankCache = ResponseCache<Arc<RerankResult>>;

/// One inbound query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    /// Query text
    pub text: String,
    /// Number of results requested
    pub top_k: usize,
    /// Whether to rerank the search candidates
    pub rerank: bool,
}

/// Where an answer came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Fresh cache entry
    Cache,
    /// Upstream call (led or joined)
    Upstream,
    /// Expired cache entry served because upstream failed
    Stale,
}

/// Answer to a query
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Result set
    pub result: Arc<RerankResult>,
    /// Origin of the result
    pub source: Source,
    /// Query fingerprint
    pub fingerprint: Fingerprint,
}

impl Resolution {
    /// Whether the answer is an expired cache entry
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.source == Source::Stale
    }
}

/// Resolves queries through cache, single-flight and the guarded rerank call
pub struct QueryResolver {
    backends: Backends,
    cache: Arc<RerankCache>,
    cache_config: CacheConfig,
    rerank: Failsafe,
    search: Failsafe,
    index_version: AtomicU64,
    flights: SingleFlight<Fingerprint, Arc<RerankResult>>,
    samples: SampleSink,
    fallback: FallbackPolicy,
    route: Arc<str>,
    upstream_budget: Duration,
}

impl QueryResolver {
    /// Create a resolver over shared service objects
    #[must_use]
    pub fn new(
        backends: Backends,
        cache: Arc<RerankCache>,
        cache_config: CacheConfig,
        rerank: Failsafe,
        samples: SampleSink,
        resolver_config: &ResolverConfig,
        upstream_budget: Duration,
    ) -> Self {
        Self {
            backends,
            cache,
            cache_config,
            rerank,
            search: Failsafe::retry_only(
                "search",
                &RetryConfig {
                    enabled: false,
                    ..RetryConfig::default()
                },
            ),
            index_version: AtomicU64::new(1),
            flights: SingleFlight::new(),
            samples,
            fallback: resolver_config.fallback,
            route: Arc::from(resolver_config.route.as_str()),
            upstream_budget,
        }
    }

    /// Retry failed vector searches with `retry`
    #[must_use]
    pub fn with_search_retry(mut self, retry: &RetryConfig) -> Self {
        self.search = Failsafe::retry_only("search", retry);
        self
    }

    /// Index version folded into every fingerprint
    #[must_use]
    pub fn index_version(&self) -> u64 {
        self.index_version.load(Ordering::Acquire)
    }

    /// Mark the index as changed; earlier cache entries stop matching
    ///
    /// Returns the new version.
    pub fn bump_index_version(&self) -> u64 {
        let version = self.index_version.fetch_add(1, Ordering::AcqRel) + 1;
        info!(index_version = version, "Index version bumped, cached results invalidated");
        version
    }

    /// The rerank dependency's failsafe
    #[must_use]
    pub fn rerank_failsafe(&self) -> &Failsafe {
        &self.rerank
    }

    /// The result cache
    #[must_use]
    pub fn cache(&self) -> &Arc<RerankCache> {
        &self.cache
    }

    /// Upstream calls currently in flight
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.flights.in_flight()
    }

    /// Resolve `query`, waiting no later than `deadline`
    ///
    /// # Errors
    ///
    /// - [`Error::SearchFailure`] when embedding or vector search fails
    /// - [`Error::BreakerOpen`] / [`Error::RetriesExhausted`] /
    ///   [`Error::DependencyFailure`] when rerank fails and no stale value is
    ///   available (or the fallback is disabled)
    /// - [`Error::DeadlineExceeded`] when `deadline` passes first
    #[tracing::instrument(skip(self, query), fields(route = %self.route, k = query.top_k, rerank = query.rerank))]
    pub async fn resolve(&self, query: &Query, deadline: Instant) -> Result<Resolution> {
        let started = Instant::now();
        let fingerprint =
            Fingerprint::versioned(&query.text, query.top_k, query.rerank, self.index_version());

        if self.cache_config.enabled {
            if let Some(result) = self.cache.get(&fingerprint) {
                exporter::record_cache_hit(&self.route);
                self.emit(started, Outcome::CacheHit);
                debug!(fingerprint = %fingerprint.short(), "Cache hit");
                return Ok(Resolution {
                    result,
                    source: Source::Cache,
                    fingerprint,
                });
            }
            exporter::record_cache_miss(&self.route);
            self.emit(started, Outcome::CacheMiss);
        }

        let work = {
            let backends = self.backends.clone();
            let cache = Arc::clone(&self.cache);
            let cache_config = self.cache_config.clone();
            let rerank = self.rerank.clone();
            let search = self.search.clone();
            let query = query.clone();
            let key = fingerprint.clone();
            let budget = Instant::now() + self.upstream_budget;
            move || async move {
                let result = fetch(&backends, &search, &rerank, &query, budget).await?;
                let result = Arc::new(result);
                if cache_config.enabled {
                    let ttl = if result.is_empty() {
                        cache_config.empty_result_ttl
                    } else {
                        cache_config.default_ttl
                    };
                    cache.put(key, Arc::clone(&result), ttl);
                }
                Ok(result)
            }
        };

        match self.flights.run(fingerprint.clone(), deadline, work).await {
            Ok((result, role)) => {
                self.emit(started, Outcome::Success);
                debug!(fingerprint = %fingerprint.short(), ?role, hits = result.hits.len(), "Resolved upstream");
                Ok(Resolution {
                    result,
                    source: Source::Upstream,
                    fingerprint,
                })
            }
            Err(e) => {
                // Fast-fail rejections carry no dependency latency
                let outcome = if matches!(e, Error::BreakerOpen { .. }) {
                    Outcome::Rejected
                } else {
                    Outcome::Failure
                };
                self.emit(started, outcome);
                self.fall_back(fingerprint, e)
            }
        }
    }

    fn fall_back(&self, fingerprint: Fingerprint, error: Error) -> Result<Resolution> {
        let eligible = self.fallback == FallbackPolicy::StaleCache
            && self.cache_config.enabled
            && (error.is_degradable() || matches!(error, Error::SearchFailure(_)));

        if eligible {
            if let Some(result) = self.cache.get_stale(&fingerprint) {
                warn!(
                    fingerprint = %fingerprint.short(),
                    error = %error,
                    "Serving stale result"
                );
                return Ok(Resolution {
                    result,
                    source: Source::Stale,
                    fingerprint,
                });
            }
        }
        Err(error)
    }

    fn emit(&self, started: Instant, outcome: Outcome) {
        self.samples.emit(LatencySample::now(
            Arc::clone(&self.route),
            started.elapsed(),
            outcome,
        ));
    }
}

/// Display prefix of [`Error::SearchFailure`]
const SEARCH_FAILED: &str = "Vector search failed: ";

/// Embed, search and (optionally) rerank one query
async fn fetch(
    backends: &Backends,
    search: &Failsafe,
    rerank: &Failsafe,
    query: &Query,
    budget: Instant,
) -> Result<RerankResult> {
    let vector = backends.embedder.embed(&query.text).await.inspect_err(|e| {
        exporter::record_search_error();
        warn!(error = %e, "Embedding failed");
    })?;

    let index = &backends.search;
    let vector = vector.as_slice();
    let top_k = query.top_k;
    let candidates = search
        .call(Some(budget), move || index.search(vector, top_k))
        .await
        .map_err(|e| match e {
            Error::RetriesExhausted { attempts, last, .. } => {
                let cause = last.strip_prefix(SEARCH_FAILED).unwrap_or(&last);
                Error::SearchFailure(format!("{cause} (after {attempts} attempts)"))
            }
            other => other,
        })
        .inspect_err(|e| {
            exporter::record_search_error();
            warn!(error = %e, "Vector search failed");
        })?;

    if !query.rerank || candidates.is_empty() {
        return Ok(RerankResult { hits: candidates });
    }

    let reranker = &backends.reranker;
    let text = query.text.as_str();
    let candidates = candidates.as_slice();
    let hits = rerank
        .call(Some(budget), move || reranker.rerank(text, candidates))
        .await
        .inspect_err(|e| {
            exporter::record_rerank_error();
            warn!(error = %e, "Rerank failed");
        })?;

    Ok(RerankResult { hits })
}
