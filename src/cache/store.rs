//! Fixed-capacity LRU storage for cached responses.
//!
//! A thin wrapper over [`lru::LruCache`] that keeps per-entry TTL and access
//! bookkeeping. Freshness decisions and statistics live in the
//! [`CacheManager`](super::CacheManager); this type only stores and evicts.

use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use tokio::time::Instant;

use crate::http::Response;

/// One cached response with its freshness and access bookkeeping.
#[derive(Debug, Clone)]
pub(crate) struct CacheEntry {
    pub response: Response,
    pub created_at: Instant,
    pub ttl: Duration,
    pub access_count: u64,
    pub last_accessed_at: Instant,
}

impl CacheEntry {
    pub fn new(response: Response, ttl: Duration, now: Instant) -> Self {
        Self {
            response,
            created_at: now,
            ttl,
            access_count: 0,
            last_accessed_at: now,
        }
    }

    /// Entries are fresh through the full TTL, stale strictly after it.
    pub fn is_fresh(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) <= self.ttl
    }

    pub fn touch(&mut self, now: Instant) {
        self.access_count += 1;
        self.last_accessed_at = now;
    }
}

pub(crate) struct LruStore {
    entries: LruCache<String, CacheEntry>,
}

impl LruStore {
    /// Creates a store holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: LruCache::new(non_zero(capacity)),
        }
    }

    /// Looks up an entry, bumping its recency.
    pub fn get(&mut self, key: &str) -> Option<&mut CacheEntry> {
        self.entries.get_mut(key)
    }

    /// Inserts an entry, evicting the least-recently-used one at capacity.
    ///
    /// Returns the displaced `(key, entry)` pair: the previous value when
    /// `key` was already present, or the evicted entry when the store was
    /// full.
    pub fn insert(&mut self, key: String, entry: CacheEntry) -> Option<(String, CacheEntry)> {
        self.entries.push(key, entry)
    }

    /// Removes an entry without touching recency of the others.
    pub fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        self.entries.pop(key)
    }

    /// Changes capacity, evicting least-recently-used entries down to it.
    pub fn resize(&mut self, capacity: usize) {
        self.entries.resize(non_zero(capacity));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    /// Keys in most- to least-recently-used order.
    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|(key, _)| key.clone()).collect()
    }

    /// Keys of entries already past their TTL at `now`.
    pub fn expired_keys(&self, now: Instant) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, entry)| !entry.is_fresh(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Iterates entries mutably without changing recency order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut CacheEntry)> {
        self.entries.iter_mut()
    }
}

fn non_zero(capacity: usize) -> NonZeroUsize {
    NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(now: Instant) -> CacheEntry {
        CacheEntry::new(Response::new(200), Duration::from_secs(60), now)
    }

    #[test]
    fn eviction_follows_recency() {
        let now = Instant::now();
        let mut store = LruStore::new(3);
        store.insert("a".into(), entry(now));
        store.insert("b".into(), entry(now));
        store.insert("c".into(), entry(now));

        // Touch a and b so c becomes least recently used.
        assert!(store.get("a").is_some());
        assert!(store.get("b").is_some());

        let evicted = store.insert("d".into(), entry(now));
        assert_eq!(evicted.map(|(key, _)| key), Some("c".to_owned()));

        let mut keys = store.keys();
        keys.sort();
        assert_eq!(keys, ["a", "b", "d"]);
    }

    #[test]
    fn replacing_a_key_is_not_an_eviction() {
        let now = Instant::now();
        let mut store = LruStore::new(2);
        store.insert("a".into(), entry(now));
        let displaced = store.insert("a".into(), entry(now));
        assert_eq!(displaced.map(|(key, _)| key), Some("a".to_owned()));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn resize_evicts_down() {
        let now = Instant::now();
        let mut store = LruStore::new(4);
        for key in ["a", "b", "c", "d"] {
            store.insert(key.into(), entry(now));
        }
        store.resize(2);
        assert_eq!(store.len(), 2);
        let mut keys = store.keys();
        keys.sort();
        assert_eq!(keys, ["c", "d"]);
    }
}
