//! # Cache Module
//!
//! Fingerprint cache for search results.
//!
//! Repeated searches for the same query hit the in-memory cache instead of
//! spawning another yt-dlp search. Queries are normalized before use as a
//! key, so `"Daft Punk"` and `"daft punk "` share an entry.
//!
//! ## Features
//!
//! - **TTL Support**: every entry expires a fixed time after it was stored
//! - **LRU Eviction**: the number of entries is capped; the least recently
//!   used entry goes first once the cap is exceeded
//! - **Thread Safety**: backed by [`dashmap::DashMap`], safe to share across tasks
//! - **Performance Metrics**: hit/miss/eviction counters
//!
//! ## Configuration
//!
//! ```env
//! SEARCH_CACHE_TTL=10m         # Time-to-live per entry
//! SEARCH_CACHE_CAPACITY=500    # Maximum number of cached queries
//! ```
//!
//! Expired entries are dropped lazily on lookup and proactively by the
//! periodic maintenance task (see [`crate::service::MusicFinder::spawn_maintenance`]).

pub mod search_cache;

pub use search_cache::{CacheMetrics, SearchCache};
