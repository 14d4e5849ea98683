//! Configuration management

use std::{collections::HashMap, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use gateway_core::{Comparison, RolloutPlan};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// Main configuration
///
/// `failsafe.circuit_breaker` and (when present) `rollout` carry deployment
/// tuning values with no defaults; loading fails if they are missing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    #[serde(default)]
    pub env_files: Vec<String>,
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Downstream dependencies
    #[serde(default)]
    pub backends: BackendsConfig,
    /// Rerank result cache
    #[serde(default)]
    pub cache: CacheConfig,
    /// Breaker and retry configuration
    pub failsafe: FailsafeConfig,
    /// Query resolution behavior
    #[serde(default)]
    pub resolver: ResolverConfig,
    /// In-process metric aggregation
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    /// Canary rollout controller (disabled when absent)
    #[serde(default)]
    pub rollout: Option<RolloutConfig>,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// lacks required tuning values, or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (RERANK_GATEWAY_ prefix)
        figment = figment.merge(Env::prefixed("RERANK_GATEWAY_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    /// Parse configuration from a YAML string (no env merge)
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let mut config: Self =
            serde_yaml::from_str(yaml).map_err(|e| Error::Config(e.to_string()))?;
        config.expand_env_vars();
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.failsafe.circuit_breaker.failure_threshold == 0 {
            return Err(Error::Config(
                "failsafe.circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.failsafe.retry.max_attempts == 0 {
            return Err(Error::Config(
                "failsafe.retry.max_attempts must be at least 1".to_string(),
            ));
        }
        let error = self.telemetry.relative_error;
        if !(error > 0.0 && error < 0.5) {
            return Err(Error::Config(format!(
                "telemetry.relative_error must be in (0, 0.5), got {error}"
            )));
        }
        if self.telemetry.slice_width.is_zero() || self.telemetry.max_window < self.telemetry.slice_width {
            return Err(Error::Config(
                "telemetry.max_window must be at least one non-zero slice_width".to_string(),
            ));
        }

        for (name, url) in [
            ("backends.embedder.url", &self.backends.embedder.url),
            ("backends.search.url", &self.backends.search.url),
            ("backends.rerank.url", &self.backends.rerank.url),
        ] {
            if !url.is_empty() {
                Url::parse(url).map_err(|e| Error::Config(format!("{name}: {e}")))?;
            }
        }

        if let Some(rollout) = &self.rollout {
            rollout.plan()?;
            if rollout.sample_interval.is_zero() {
                return Err(Error::Config(
                    "rollout.sample_interval must be non-zero".to_string(),
                ));
            }
            if rollout.source == MetricSourceConfig::InProcess
                && rollout.analysis_window > self.telemetry.max_window
            {
                return Err(Error::Config(format!(
                    "rollout.analysis_window ({:?}) exceeds telemetry.max_window ({:?}) retained in process",
                    rollout.analysis_window, self.telemetry.max_window
                )));
            }
            if let RolloutMetric::LatencyQuantile { quantile, .. } = rollout.metric {
                if !(quantile > 0.0 && quantile <= 1.0) {
                    return Err(Error::Config(format!(
                        "rollout.metric.quantile must be in (0, 1], got {quantile}"
                    )));
                }
            }
        }

        Ok(())
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in backend endpoints
    fn expand_env_vars(&mut self) {
        let Ok(re) = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") else {
            return;
        };

        for endpoint in [
            &mut self.backends.embedder,
            &mut self.backends.rerank,
        ] {
            endpoint.url = Self::expand_string(&re, &endpoint.url);
            for value in endpoint.headers.values_mut() {
                *value = Self::expand_string(&re, value);
            }
        }
        self.backends.search.url = Self::expand_string(&re, &self.backends.search.url);
        for value in self.backends.search.headers.values_mut() {
            *value = Self::expand_string(&re, value);
        }
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Overall deadline for one inbound query
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
    /// Allowed CORS origins
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            request_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 1_000_000,
            cors_origins: vec![
                "http://localhost:3000".to_string(),
                "http://localhost:8080".to_string(),
                "http://127.0.0.1:3000".to_string(),
            ],
        }
    }
}

/// Downstream dependency endpoints
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendsConfig {
    /// Text → vector embedding endpoint
    pub embedder: EndpointConfig,
    /// Vector search endpoint
    pub search: SearchConfig,
    /// Rerank endpoint (guarded by the circuit breaker)
    pub rerank: EndpointConfig,
}

/// Plain HTTP JSON endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Endpoint URL
    pub url: String,
    /// Per-request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Extra HTTP headers
    pub headers: HashMap<String, String>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout: Duration::from_secs(2),
            headers: HashMap::new(),
        }
    }
}

/// Vector search endpoint (Qdrant-compatible REST)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Base URL, e.g. `http://qdrant:6333`
    pub url: String,
    /// Collection to query
    pub collection: String,
    /// Per-request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Extra HTTP headers
    pub headers: HashMap<String, String>,
    /// Retries for failed searches (no circuit breaker)
    pub retry: RetryConfig,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            collection: "documents".to_string(),
            timeout: Duration::from_secs(2),
            headers: HashMap::new(),
            retry: RetryConfig {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(200),
                max_backoff: Duration::from_secs(1),
                ..RetryConfig::default()
            },
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enable response caching
    pub enabled: bool,
    /// TTL for non-empty results
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,
    /// TTL for results with no hits
    #[serde(with = "humantime_serde")]
    pub empty_result_ttl: Duration,
    /// Maximum number of entries before eviction
    pub max_entries: usize,
    /// Background sweep interval
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// How long past its TTL an entry stays available to the stale fallback
    #[serde(with = "humantime_serde")]
    pub stale_retention: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl: Duration::from_secs(120),
            empty_result_ttl: Duration::from_secs(10),
            max_entries: 10_000,
            sweep_interval: Duration::from_secs(30),
            stale_retention: Duration::from_secs(600),
        }
    }
}

/// Failsafe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailsafeConfig {
    /// Circuit breaker configuration (required)
    pub circuit_breaker: CircuitBreakerConfig,
    /// Retry configuration
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Enable circuit breaker
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Time to stay open before admitting a probe
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
}

fn default_true() -> bool {
    true
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Enable retries
    pub enabled: bool,
    /// Maximum attempts (including the first)
    pub max_attempts: u32,
    /// Base backoff, doubled per attempt before jitter
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Timeout for a single attempt
    #[serde(with = "humantime_serde")]
    pub attempt_timeout: Duration,
    /// Total time a shared upstream call may spend retrying
    #[serde(with = "humantime_serde")]
    pub budget: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            attempt_timeout: Duration::from_secs(2),
            budget: Duration::from_secs(5),
        }
    }
}

/// What the resolver does when rerank fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Serve the last cached value (marked stale) if one exists
    #[default]
    StaleCache,
    /// Always surface the error
    Propagate,
}

/// Query resolution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Fallback when the rerank dependency is unavailable
    pub fallback: FallbackPolicy,
    /// Route label attached to emitted samples
    pub route: String,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            fallback: FallbackPolicy::StaleCache,
            route: "/rag".to_string(),
        }
    }
}

/// In-process metric aggregation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Sample hand-off buffer (samples beyond this are dropped, never awaited)
    pub channel_capacity: usize,
    /// Width of one time slice of the rolling window
    #[serde(with = "humantime_serde")]
    pub slice_width: Duration,
    /// Longest window a query may ask for
    #[serde(with = "humantime_serde")]
    pub max_window: Duration,
    /// Relative error bound of quantile estimates
    pub relative_error: f64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 8192,
            slice_width: Duration::from_secs(1),
            max_window: Duration::from_secs(600),
            relative_error: 0.01,
        }
    }
}

/// Metric the rollout is gated on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RolloutMetric {
    /// Request latency quantile in milliseconds (e.g. p95)
    LatencyQuantile {
        /// Quantile in (0, 1]
        quantile: f64,
        /// Route label
        #[serde(default = "default_route")]
        route: String,
    },
    /// Cache hit rate in [0, 1]
    HitRate {
        /// Route label
        #[serde(default = "default_route")]
        route: String,
    },
}

fn default_route() -> String {
    "/rag".to_string()
}

impl RolloutMetric {
    /// Direction in which the metric is healthy
    #[must_use]
    pub fn comparison(&self) -> Comparison {
        match self {
            Self::LatencyQuantile { .. } => Comparison::AtMost,
            Self::HitRate { .. } => Comparison::AtLeast,
        }
    }

    /// Route label the metric is read for
    #[must_use]
    pub fn route(&self) -> &str {
        match self {
            Self::LatencyQuantile { route, .. } | Self::HitRate { route } => route,
        }
    }

    /// Human-readable name, e.g. `p95_latency_ms`
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::LatencyQuantile { quantile, .. } => {
                format!("p{}_latency_ms", (quantile * 100.0).round())
            }
            Self::HitRate { .. } => "cache_hit_rate".to_string(),
        }
    }
}

/// Where analysis reads its metric
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricSourceConfig {
    /// The gateway's own aggregator
    #[default]
    InProcess,
    /// A Prometheus-compatible query API
    Prometheus {
        /// Base URL, e.g. `http://prometheus:9090`
        url: String,
        /// Override the generated PromQL
        #[serde(default)]
        query: Option<String>,
    },
}

/// Where rollout commands are sent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlPlaneConfig {
    /// Log commands only (dry run)
    #[default]
    Log,
    /// POST commands to a rollout API
    Http {
        /// Base URL of the rollout resource
        url: String,
        /// Extra HTTP headers
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

/// Canary rollout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutConfig {
    /// Release identifier, used in logs and reports
    #[serde(default = "default_release")]
    pub release: String,
    /// Traffic weights, strictly increasing, ending at 100
    pub stages: Vec<u8>,
    /// Wait at each stage before analysis
    #[serde(with = "humantime_serde")]
    pub bake_time: Duration,
    /// Span of one analysis run
    #[serde(with = "humantime_serde")]
    pub analysis_window: Duration,
    /// Spacing between metric samples inside the window
    #[serde(with = "humantime_serde")]
    pub sample_interval: Duration,
    /// Timeout of a single metric query
    #[serde(with = "humantime_serde")]
    pub analysis_timeout: Duration,
    /// Threshold in the metric's unit
    pub threshold: f64,
    /// Metric gated on
    pub metric: RolloutMetric,
    /// Inconclusive analyses tolerated per stage before failing closed
    #[serde(default = "default_inconclusive_retries")]
    pub max_inconclusive_retries: u32,
    /// Delay before re-running an inconclusive analysis
    #[serde(
        with = "humantime_serde",
        default = "default_inconclusive_retry_delay"
    )]
    pub inconclusive_retry_delay: Duration,
    /// Metric source
    #[serde(default)]
    pub source: MetricSourceConfig,
    /// Deployment control plane
    #[serde(default)]
    pub control_plane: ControlPlaneConfig,
    /// Webhook notified on rollback
    #[serde(default)]
    pub notify_webhook: Option<String>,
}

fn default_release() -> String {
    "canary".to_string()
}

fn default_inconclusive_retries() -> u32 {
    3
}

fn default_inconclusive_retry_delay() -> Duration {
    Duration::from_secs(30)
}

impl RolloutConfig {
    /// Validated stage plan
    pub fn plan(&self) -> Result<RolloutPlan> {
        RolloutPlan::new(self.stages.clone(), self.max_inconclusive_retries)
            .map_err(|e| Error::Config(format!("rollout.stages: {e}")))
    }
}

/// Human-readable `Duration` serde ("250ms", "30s", "5m", "1h")
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to a human-readable string
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize a human-readable duration string
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse "250ms", "30s", "5m", "1h" or a bare number of seconds
    pub fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.trim().parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.trim().parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.trim().parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.trim().parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}
