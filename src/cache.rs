//! Rerank result cache with TTL
//!
//! Thread-safe, sharded (`DashMap`) store from [`Fingerprint`] to a cached
//! value. Entries are immutable once inserted; they are only replaced or
//! evicted.
//!
//! Expiry is lazy: [`ResponseCache::get`] never returns an entry older than its
//! TTL. Expired entries stay in the map for `stale_retention` so the stale
//! fallback ([`ResponseCache::get_stale`]) can still serve them while the
//! rerank dependency is down; the background sweep removes them afterwards.
//!
//! Capacity is enforced after insertion. Once the bound is crossed one
//! caller at a time drops dead entries and then the oldest tenth, so the
//! O(n) scan is amortized across many puts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::fingerprint::Fingerprint;

/// Thread-safe response cache with TTL expiry
pub struct ResponseCache<V> {
    entries: DashMap<Fingerprint, CacheEntry<V>>,
    stats: CacheStats,
    max_entries: usize,
    stale_retention: Duration,
    shrinking: Mutex<()>,
}

/// Share of `max_entries` freed by one capacity eviction
const EVICTION_BATCH_DIVISOR: usize = 10;

/// A cached value with TTL metadata
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) > self.ttl
    }

    fn is_past_retention(&self, now: Instant, retention: Duration) -> bool {
        now.saturating_duration_since(self.inserted_at) > self.ttl.saturating_add(retention)
    }
}

/// Cache statistics tracked atomically
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Fresh entries served
    pub hits: AtomicU64,
    /// Lookups that found nothing fresh
    pub misses: AtomicU64,
    /// Expired entries served by the fallback
    pub stale_hits: AtomicU64,
    /// Entries removed by expiry sweeps or capacity pressure
    pub evictions: AtomicU64,
}

impl CacheStats {
    /// Fraction of lookups served fresh (0.0-1.0)
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

impl<V: Clone> ResponseCache<V> {
    /// Create an empty cache
    ///
    /// `max_entries == 0` disables the capacity bound.
    #[must_use]
    pub fn new(max_entries: usize, stale_retention: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            stats: CacheStats::default(),
            max_entries,
            stale_retention,
            shrinking: Mutex::new(()),
        }
    }

    /// Fresh value for `key`, if any
    pub fn get(&self, key: &Fingerprint) -> Option<V> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.is_expired(now) {
                let dead = entry.is_past_retention(now, self.stale_retention);
                drop(entry);
                if dead && self.entries.remove(key).is_some() {
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                }
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            } else {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Last stored value for `key` regardless of TTL (fallback path only)
    pub fn get_stale(&self, key: &Fingerprint) -> Option<V> {
        let value = self.entries.get(key).map(|entry| entry.value.clone());
        if value.is_some() {
            self.stats.stale_hits.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    /// Store `value` for `ttl`, replacing any previous entry
    pub fn put(&self, key: Fingerprint, value: V, ttl: Duration) {
        let entry = CacheEntry {
            value,
            inserted_at: Instant::now(),
            ttl,
        };
        self.entries.insert(key, entry);

        if self.over_capacity() {
            self.shrink();
        }
    }

    fn over_capacity(&self) -> bool {
        self.max_entries > 0 && self.entries.len() > self.max_entries
    }

    fn shrink(&self) {
        let _guard = self.shrinking.lock();
        // Another put may have shrunk while this one waited
        if !self.over_capacity() {
            return;
        }
        self.evict_expired();
        if !self.over_capacity() {
            return;
        }

        let target = self.max_entries - self.max_entries / EVICTION_BATCH_DIVISOR;
        let excess = self.entries.len().saturating_sub(target);
        self.evict_oldest(excess);
    }

    /// Remove entries past their TTL plus the stale retention window
    ///
    /// Returns the number of entries removed.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let retention = self.stale_retention;
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| !entry.is_past_retention(now, retention));
        let count = before.saturating_sub(self.entries.len());

        if count > 0 {
            self.stats
                .evictions
                .fetch_add(count as u64, Ordering::Relaxed);
        }
        count
    }

    fn evict_oldest(&self, count: usize) {
        if count == 0 {
            return;
        }
        let mut ages: Vec<(Instant, Fingerprint)> = self
            .entries
            .iter()
            .map(|entry| (entry.value().inserted_at, entry.key().clone()))
            .collect();
        if count < ages.len() {
            ages.select_nth_unstable_by_key(count, |(inserted_at, _)| *inserted_at);
            ages.truncate(count);
        }

        let removed = ages
            .into_iter()
            .filter(|(_, key)| self.entries.remove(key).is_some())
            .count();
        self.stats
            .evictions
            .fetch_add(removed as u64, Ordering::Relaxed);
    }

    /// Clear all cached entries
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of stored entries, fresh or stale
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            stale_hits: self.stats.stale_hits.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            size: self.entries.len(),
            hit_rate: self.stats.hit_rate(),
        }
    }
}

/// Snapshot of cache statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStatsSnapshot {
    /// Fresh entries served
    pub hits: u64,
    /// Lookups that found nothing fresh
    pub misses: u64,
    /// Expired entries served by the fallback
    pub stale_hits: u64,
    /// Entries removed
    pub evictions: u64,
    /// Current number of entries
    pub size: usize,
    /// Hit rate (0.0-1.0)
    pub hit_rate: f64,
}
