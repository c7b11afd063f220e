//! Response caching — TTL semantics, key derivation, and statistics over a
//! fixed-capacity LRU store.
//!
//! The manager is policy-free: *which* requests are cacheable (GET, 2xx) is
//! decided by the cache middleware. The manager answers `get`/`set` against
//! deterministic keys, expires entries lazily on read, and keeps lifetime
//! hit/miss counters that survive clears.

mod store;

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::http::{CachePolicy, Request, Response};
use crate::sync::mutex_lock;
use store::{CacheEntry, LruStore};

const COMPONENT: &str = "cache";

/// Construction-time cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of entries held at once.
    pub max_size: usize,
    /// TTL applied when a request does not carry its own.
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            default_ttl: Duration::from_secs(300),
        }
    }
}

/// Partial update applied by [`CacheManager::update_config`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfigUpdate {
    /// New capacity; shrinking evicts least-recently-used entries down to it.
    pub max_size: Option<usize>,
    /// New default TTL; unexpired entries with a shorter TTL are extended to
    /// it, entries already past their TTL are dropped.
    pub default_ttl: Option<Duration>,
}

/// A point-in-time snapshot of cache occupancy and lifetime effectiveness.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// Entries currently stored.
    pub size: usize,
    /// Configured capacity.
    pub max_size: usize,
    /// Lifetime hits (persist across clears).
    pub hit_count: u64,
    /// Lifetime misses (persist across clears).
    pub miss_count: u64,
    /// `hit_count / (hit_count + miss_count)`, `0.0` before any lookup.
    pub hit_rate: f64,
    /// Stored keys, most- to least-recently-used.
    pub keys: Vec<String>,
}

/// TTL + LRU response cache with lifetime statistics.
pub struct CacheManager {
    state: Mutex<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
}

struct CacheState {
    store: LruStore,
    default_ttl: Duration,
}

impl CacheManager {
    /// Creates a manager with the given capacity and default TTL.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            state: Mutex::new(CacheState {
                store: LruStore::new(config.max_size),
                default_ttl: config.default_ttl,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the cached response for `key` if present and fresh.
    ///
    /// A fresh hit bumps LRU recency and the entry's access counters. A
    /// stale entry is evicted on the spot and counted as a miss.
    pub fn get(&self, key: &str) -> Option<Response> {
        let now = Instant::now();
        let mut state = mutex_lock(&self.state, COMPONENT, "get");
        let fresh = match state.store.get(key) {
            Some(entry) if entry.is_fresh(now) => {
                entry.touch(now);
                Some((entry.response.clone(), entry.access_count))
            }
            Some(_) => None,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        match fresh {
            Some((response, hits)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(key, hits, "cache hit");
                Some(response)
            }
            None => {
                if let Some(entry) = state.store.remove(key) {
                    debug!(
                        key,
                        idle = ?now.duration_since(entry.last_accessed_at),
                        "cache entry expired"
                    );
                }
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Stores a response under `key` with the given or default TTL.
    pub fn set(&self, key: String, response: Response, ttl: Option<Duration>) {
        let now = Instant::now();
        let mut state = mutex_lock(&self.state, COMPONENT, "set");
        let ttl = ttl.unwrap_or(state.default_ttl);
        let displaced = state
            .store
            .insert(key.clone(), CacheEntry::new(response, ttl, now));
        if let Some((displaced, _)) = displaced {
            if displaced != key {
                debug!(key = %displaced, "evicted least-recently-used entry");
            }
        }
    }

    /// Derives the cache key for a request: the request's custom generator
    /// when configured, else the default identity composition.
    pub fn key_for(&self, request: &Request) -> String {
        if let CachePolicy::Enabled {
            key_generator: Some(generator),
            ..
        } = &request.cache
        {
            generator(request)
        } else {
            request.identity_key()
        }
    }

    /// Applies a capacity and/or TTL update.
    ///
    /// Shrinking capacity evicts down immediately. A new default TTL drops
    /// entries that have already expired and extends the TTL of surviving
    /// entries that carried a shorter one; it never revives stale data.
    pub fn update_config(&self, update: CacheConfigUpdate) {
        let now = Instant::now();
        let mut state = mutex_lock(&self.state, COMPONENT, "update_config");
        if let Some(ttl) = update.default_ttl {
            state.default_ttl = ttl;
            for key in state.store.expired_keys(now) {
                state.store.remove(&key);
            }
            for (_, entry) in state.store.iter_mut() {
                if ttl > entry.ttl {
                    entry.ttl = ttl;
                }
            }
        }
        if let Some(max_size) = update.max_size {
            state.store.resize(max_size);
        }
    }

    /// Empties the store. Lifetime hit/miss counters are kept.
    pub fn clear(&self) {
        let mut state = mutex_lock(&self.state, COMPONENT, "clear");
        state.store.clear();
        debug!("cache cleared");
    }

    /// Removes entries whose key contains `pattern`; returns how many.
    pub fn clear_matching(&self, pattern: &str) -> usize {
        let mut state = mutex_lock(&self.state, COMPONENT, "clear_matching");
        let matching: Vec<String> = state
            .store
            .keys()
            .into_iter()
            .filter(|key| key.contains(pattern))
            .collect();
        for key in &matching {
            state.store.remove(key);
        }
        debug!(pattern, removed = matching.len(), "cache entries cleared");
        matching.len()
    }

    /// Current occupancy and lifetime effectiveness.
    pub fn stats(&self) -> CacheStats {
        let state = mutex_lock(&self.state, COMPONENT, "stats");
        let hit_count = self.hits.load(Ordering::Relaxed);
        let miss_count = self.misses.load(Ordering::Relaxed);
        let total = hit_count + miss_count;
        CacheStats {
            size: state.store.len(),
            max_size: state.store.capacity(),
            hit_count,
            miss_count,
            hit_rate: if total == 0 {
                0.0
            } else {
                hit_count as f64 / total as f64
            },
            keys: state.store.keys(),
        }
    }
}
