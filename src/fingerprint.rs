//! Query fingerprints
//!
//! A fingerprint is the SHA-256 of the index version, the normalized query
//! text, the requested top-k and the rerank flag. It keys both the result
//! cache and the single-flight registry, so two requests that differ only in
//! case, padding or underscore/space runs share one upstream call. Bumping the
//! index version orphans every earlier entry.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identity of a query for caching and in-flight deduplication
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint a query against the initial index version
    #[must_use]
    pub fn compute(query: &str, top_k: usize, rerank: bool) -> Self {
        Self::versioned(query, top_k, rerank, 1)
    }

    /// Fingerprint a query against a specific index version
    #[must_use]
    pub fn versioned(query: &str, top_k: usize, rerank: bool, index_version: u64) -> Self {
        let canonical = format!(
            "{index_version}|{}|{top_k}|{}",
            normalize_query(query),
            u8::from(rerank)
        );
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let result = hasher.finalize();
        Self(format!("{result:x}"))
    }

    /// Hex digest
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log fields
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase, trim, and collapse whitespace/underscore runs to one space
#[must_use]
pub fn normalize_query(query: &str) -> String {
    query
        .to_lowercase()
        .split(|c: char| c.is_whitespace() || c == '_')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
