//! Downstream dependencies
//!
//! The resolver talks to three capabilities through traits so tests and
//! alternative deployments can swap them:
//!
//! - [`Embedder`]: query text to vector
//! - [`VectorSearch`]: vector to scored candidates (failures are [`Error::SearchFailure`])
//! - [`Reranker`]: query plus candidates to a reordered list (guarded by the breaker)
//!
//! HTTP bindings live in [`http`].

pub mod http;

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Result;
use crate::config::BackendsConfig;

pub use http::{HttpEmbedder, HttpReranker, QdrantSearch};

/// One retrieved passage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    /// 1-based position in the result list
    pub rank: usize,
    /// Point id in the vector index
    pub id: Value,
    /// Similarity (or rerank) score
    pub score: f64,
    /// Passage text
    #[serde(default)]
    pub text: String,
    /// Source document title
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Source document URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Source document id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<Value>,
    /// Chunk index inside the source document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<u64>,
    /// Whether the position comes from the reranker
    #[serde(default)]
    pub reranked: bool,
}

/// Value cached per fingerprint and returned to callers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RerankResult {
    /// Ordered hits
    pub hits: Vec<Hit>,
}

impl RerankResult {
    /// Whether no passage matched
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }
}

/// Turns query text into a vector
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed one query
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Nearest-neighbor lookup
#[async_trait]
pub trait VectorSearch: Send + Sync {
    /// Top `k` candidates for `vector`, best first
    async fn search(&self, vector: &[f32], k: usize) -> Result<Vec<Hit>>;
}

/// Relevance reranking of search candidates
#[async_trait]
pub trait Reranker: Send + Sync {
    /// Reorder `candidates` for `query`
    async fn rerank(&self, query: &str, candidates: &[Hit]) -> Result<Vec<Hit>>;
}

/// The resolver's downstream dependencies
#[derive(Clone)]
pub struct Backends {
    /// Embedding capability
    pub embedder: Arc<dyn Embedder>,
    /// Vector search capability
    pub search: Arc<dyn VectorSearch>,
    /// Rerank capability
    pub reranker: Arc<dyn Reranker>,
}

impl Backends {
    /// Build HTTP bindings from configuration
    ///
    /// # Errors
    ///
    /// Returns an error if an HTTP client cannot be built.
    pub fn from_config(config: &BackendsConfig) -> Result<Self> {
        Ok(Self {
            embedder: Arc::new(HttpEmbedder::new(&config.embedder)?),
            search: Arc::new(QdrantSearch::new(&config.search)?),
            reranker: Arc::new(HttpReranker::new(&config.rerank)?),
        })
    }
}

/// Reorder `candidates` by `scores` (`(index, score)` pairs), best first
///
/// Candidates without a score rank as 0.0. Ties keep search order. Ranks are
/// renumbered from 1 and every hit is marked reranked.
#[must_use]
pub fn apply_scores(candidates: &[Hit], scores: &[(usize, f64)]) -> Vec<Hit> {
    let mut scored: Vec<(f64, &Hit)> = candidates.iter().map(|hit| (0.0, hit)).collect();
    for &(index, score) in scores {
        if let Some(slot) = scored.get_mut(index) {
            slot.0 = score;
        }
    }
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));

    scored
        .into_iter()
        .enumerate()
        .map(|(i, (score, hit))| Hit {
            rank: i + 1,
            score,
            reranked: true,
            ..hit.clone()
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    pub(crate) fn hit(rank: usize, text: &str) -> Hit {
        Hit {
            rank,
            id: json!(rank),
            score: 1.0 / rank as f64,
            text: text.to_string(),
            title: None,
            url: None,
            doc_id: None,
            chunk: None,
            reranked: false,
        }
    }

    #[test]
    fn scores_reorder_and_renumber() {
        let candidates = vec![hit(1, "a"), hit(2, "b"), hit(3, "c")];
        let reranked = apply_scores(&candidates, &[(0, 2.0), (2, 9.5), (1, 5.0)]);

        let texts: Vec<_> = reranked.iter().map(|h| h.text.as_str()).collect();
        assert_eq!(texts, vec!["c", "b", "a"]);
        assert_eq!(reranked[0].rank, 1);
        assert_eq!(reranked[0].score, 9.5);
        assert!(reranked.iter().all(|h| h.reranked));
    }

    #[test]
    fn unscored_candidates_sink_and_bad_indices_are_ignored() {
        let candidates = vec![hit(1, "a"), hit(2, "b")];
        let reranked = apply_scores(&candidates, &[(1, 3.0), (7, 10.0)]);
        assert_eq!(reranked[0].text, "b");
        assert_eq!(reranked[1].text, "a");
        assert_eq!(reranked[1].score, 0.0);
    }

    #[test]
    fn hit_serialization_skips_missing_metadata() {
        let value = serde_json::to_value(hit(1, "a")).unwrap();
        assert!(value.get("title").is_none());
        assert_eq!(value["reranked"], json!(false));
    }
}
