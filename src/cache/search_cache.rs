use dashmap::DashMap;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::Instant;
use tracing::debug;

use crate::sources::VideoSummary;

/// Cached result list with an absolute expiry.
#[derive(Debug)]
struct CacheEntry {
    results: Vec<VideoSummary>,
    /// Largest result count the entry can answer for.
    fetched_limit: usize,
    expires_at: Instant,
    last_access: AtomicU64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Search results keyed by normalized query, with a fixed TTL and an LRU
/// bound on the number of entries.
///
/// Cloning is cheap and yields a handle to the same underlying map.
#[derive(Debug, Clone)]
pub struct SearchCache {
    data: Arc<DashMap<String, CacheEntry>>,
    capacity: usize,
    ttl: Duration,
    /// Monotonic access counter; smaller means less recently used.
    clock: Arc<AtomicU64>,
    metrics: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired_removals: AtomicU64,
}

impl SearchCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            data: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
            ttl,
            clock: Arc::new(AtomicU64::new(0)),
            metrics: Arc::new(Counters::default()),
        }
    }

    /// Returns the cached results for `query`, or `None` when absent or
    /// expired. Expired entries are removed on the way out.
    pub fn lookup(&self, query: &str) -> Option<Vec<VideoSummary>> {
        let key = normalize_query(query);
        let now = Instant::now();

        if let Some(entry) = self.data.get(&key) {
            if !entry.is_expired(now) {
                entry.last_access.store(self.tick(), Ordering::Relaxed);
                self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                debug!("✅ Cache hit: {:?}", key);
                return Some(entry.results.clone());
            }
        }

        // remove_if re-checks expiry so a concurrent store is never dropped.
        if self
            .data
            .remove_if(&key, |_, entry| entry.is_expired(now))
            .is_some()
        {
            self.metrics.expired_removals.fetch_add(1, Ordering::Relaxed);
            debug!("⏰ Expired cache entry removed: {:?}", key);
        }

        self.metrics.misses.fetch_add(1, Ordering::Relaxed);
        debug!("❌ Cache miss: {:?}", key);
        None
    }

    /// Like [`SearchCache::lookup`], but only answers when the entry was
    /// fetched with at least `limit` results requested, truncating to `limit`.
    pub fn lookup_page(&self, query: &str, limit: usize) -> Option<Vec<VideoSummary>> {
        let key = normalize_query(query);
        let fetched_limit = self.data.get(&key).map(|entry| entry.fetched_limit);
        let Some(fetched_limit) = fetched_limit else {
            self.metrics.misses.fetch_add(1, Ordering::Relaxed);
            debug!("❌ Cache miss: {:?}", key);
            return None;
        };
        if fetched_limit < limit {
            self.metrics.misses.fetch_add(1, Ordering::Relaxed);
            debug!("❌ Cache entry for {:?} too small ({} < {})", key, fetched_limit, limit);
            return None;
        }

        let mut results = self.lookup(query)?;
        results.truncate(limit);
        Some(results)
    }

    /// Inserts or replaces the entry for `query`, expiring `ttl` from now.
    #[allow(dead_code)]
    pub fn store(&self, query: &str, results: Vec<VideoSummary>, ttl: Duration) {
        let fetched_limit = results.len();
        self.insert(query, results, fetched_limit, ttl);
    }

    /// Stores the answer to a search issued with `limit`, using the default TTL.
    pub fn store_page(&self, query: &str, limit: usize, results: Vec<VideoSummary>) {
        self.insert(query, results, limit, self.ttl);
    }

    /// Removes the entry for `query` if present.
    #[allow(dead_code)]
    pub fn invalidate(&self, query: &str) {
        self.data.remove(&normalize_query(query));
    }

    /// Drops every expired entry and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.data.len();
        self.data.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.data.len());

        if removed > 0 {
            self.metrics
                .expired_removals
                .fetch_add(removed as u64, Ordering::Relaxed);
            debug!("Purged {} expired search cache entries", removed);
        }

        removed
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.metrics.hits.load(Ordering::Relaxed),
            misses: self.metrics.misses.load(Ordering::Relaxed),
            evictions: self.metrics.evictions.load(Ordering::Relaxed),
            expired_removals: self.metrics.expired_removals.load(Ordering::Relaxed),
        }
    }

    fn insert(&self, query: &str, results: Vec<VideoSummary>, fetched_limit: usize, ttl: Duration) {
        let key = normalize_query(query);
        let entry = CacheEntry {
            results,
            fetched_limit,
            expires_at: Instant::now() + ttl,
            last_access: AtomicU64::new(self.tick()),
        };
        self.data.insert(key.clone(), entry);

        if self.data.len() > self.capacity {
            self.purge_expired();
        }
        while self.data.len() > self.capacity {
            if !self.evict_lru(&key) {
                break;
            }
        }
    }

    fn evict_lru(&self, keep: &str) -> bool {
        let victim = self
            .data
            .iter()
            .filter(|entry| entry.key() != keep)
            .min_by_key(|entry| entry.last_access.load(Ordering::Relaxed))
            .map(|entry| entry.key().clone());

        match victim {
            Some(key) => {
                self.data.remove(&key);
                self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
                debug!("🗑️ Evicted least recently used search: {:?}", key);
                true
            }
            None => false,
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }
}

/// Hit, miss and eviction counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired_removals: u64,
}

impl CacheMetrics {
    pub fn hit_rate(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            self.hits as f64 / (self.hits + self.misses) as f64
        }
    }
}

/// Case- and whitespace-insensitive cache key.
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}
