//! HTTP bindings for the embedding, vector search and rerank dependencies

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::{Embedder, Hit, Reranker, VectorSearch, apply_scores};
use crate::config::{EndpointConfig, SearchConfig};
use crate::{Error, Result};

/// Build a pooled JSON client with the gateway's connection settings
pub(crate) fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(30))
        .tcp_nodelay(true)
        .redirect(reqwest::redirect::Policy::limited(5))
        .build()
        .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))
}

/// Convert configured headers into a `HeaderMap`
pub(crate) fn header_map(headers: &HashMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::Config(format!("invalid header name {name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::Config(format!("invalid header value for {name}: {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Embedding service speaking `{"input": text}`
///
/// Accepts either `{"embedding": [...]}` or the OpenAI-style
/// `{"data": [{"embedding": [...]}]}` response.
pub struct HttpEmbedder {
    client: Client,
    url: String,
    headers: HeaderMap,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EmbeddingResponse {
    Single { embedding: Vec<f32> },
    Batch { data: Vec<EmbeddingItem> },
}

#[derive(Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    /// Create from endpoint configuration
    pub fn new(config: &EndpointConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config.timeout)?,
            url: config.url.clone(),
            headers: header_map(&config.headers)?,
        })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let response = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .json(&json!({ "input": text }))
            .send()
            .await
            .map_err(|e| Error::SearchFailure(format!("embedding request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::SearchFailure(format!("embedder HTTP {status}: {body}")));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| Error::SearchFailure(format!("invalid embedding response: {e}")))?;

        match parsed {
            EmbeddingResponse::Single { embedding } => Ok(embedding),
            EmbeddingResponse::Batch { data } => data
                .into_iter()
                .next()
                .map(|item| item.embedding)
                .ok_or_else(|| Error::SearchFailure("embedder returned no vectors".to_string())),
        }
    }
}

/// Qdrant REST search (`POST /collections/{name}/points/search`)
pub struct QdrantSearch {
    client: Client,
    endpoint: String,
    headers: HeaderMap,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    result: Vec<ScoredPoint>,
}

#[derive(Deserialize)]
struct ScoredPoint {
    id: Value,
    score: f64,
    #[serde(default)]
    payload: Option<serde_json::Map<String, Value>>,
}

impl ScoredPoint {
    fn into_hit(self, rank: usize) -> Hit {
        let payload = self.payload.unwrap_or_default();
        let text = |key: &str| payload.get(key).and_then(Value::as_str).map(str::to_string);
        Hit {
            rank,
            id: self.id,
            score: self.score,
            text: text("text").unwrap_or_default(),
            title: text("title"),
            url: text("url"),
            doc_id: payload.get("doc_id").cloned(),
            chunk: payload.get("chunk").and_then(Value::as_u64),
            reranked: false,
        }
    }
}

impl QdrantSearch {
    /// Create from search configuration
    pub fn new(config: &SearchConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config.timeout)?,
            endpoint: format!(
                "{}/collections/{}/points/search",
                config.url.trim_end_matches('/'),
                config.collection
            ),
            headers: header_map(&config.headers)?,
        })
    }
}

#[async_trait]
impl VectorSearch for QdrantSearch {
    async fn search(&self, vector: &[f32], k: usize) -> Result<Vec<Hit>> {
        let response = self
            .client
            .post(&self.endpoint)
            .headers(self.headers.clone())
            .json(&json!({ "vector": vector, "limit": k, "with_payload": true }))
            .send()
            .await
            .map_err(|e| Error::SearchFailure(format!("search request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::SearchFailure(format!("search HTTP {status}: {body}")));
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| Error::SearchFailure(format!("invalid search response: {e}")))?;

        debug!(candidates = parsed.result.len(), "Vector search complete");
        Ok(parsed
            .result
            .into_iter()
            .enumerate()
            .map(|(i, point)| point.into_hit(i + 1))
            .collect())
    }
}

/// Rerank service speaking `{"query": q, "documents": [..]}`
///
/// Expects `{"results": [{"index": i, "score": s}, ...]}`. Network errors,
/// timeouts, 429 and 5xx are transient; other 4xx are permanent.
pub struct HttpReranker {
    client: Client,
    url: String,
    headers: HeaderMap,
}

#[derive(Deserialize)]
struct RerankResponse {
    #[serde(default, alias = "scores")]
    results: Vec<RerankScore>,
}

#[derive(Deserialize)]
struct RerankScore {
    index: usize,
    #[serde(alias = "relevance_score")]
    score: f64,
}

const RERANK: &str = "rerank";

impl HttpReranker {
    /// Create from endpoint configuration
    pub fn new(config: &EndpointConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config.timeout)?,
            url: config.url.clone(),
            headers: header_map(&config.headers)?,
        })
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

#[async_trait]
impl Reranker for HttpReranker {
    async fn rerank(&self, query: &str, candidates: &[Hit]) -> Result<Vec<Hit>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let documents: Vec<&str> = candidates.iter().map(|h| h.text.as_str()).collect();
        let response = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .json(&json!({ "query": query, "documents": documents }))
            .send()
            .await
            .map_err(|e| Error::dependency(RERANK, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("HTTP {status}: {body}");
            return Err(if is_transient_status(status) {
                Error::dependency(RERANK, message)
            } else {
                Error::dependency_permanent(RERANK, message)
            });
        }

        let parsed: RerankResponse = response
            .json()
            .await
            .map_err(|e| Error::dependency(RERANK, format!("invalid rerank response: {e}")))?;

        let scores: Vec<(usize, f64)> = parsed.results.iter().map(|s| (s.index, s.score)).collect();
        Ok(apply_scores(candidates, &scores))
    }
}
