//! TTL + size-bounded cache of query options → ranked results.
//!
//! Keys are a SHA-256 digest of the canonical JSON of the full option
//! struct, so distinct option combinations can never collide into one
//! entry. Expiry is lazy; when the size bound is hit, the entries closest
//! to expiry go first. Any store mutation clears the whole cache: simple
//! correctness over partial invalidation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::CacheSettings;
use crate::types::ScoredMemory;

#[derive(Debug, Clone)]
struct CacheEntry {
    expires_at: Instant,
    results: Vec<ScoredMemory>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

pub struct ResultCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResultCache {
    pub fn new(settings: &CacheSettings) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: Duration::from_secs(settings.ttl_secs),
            max_entries: settings.max_entries,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Stable cache key: SHA-256 over the serialized option struct. Struct
    /// field order is fixed at compile time, which makes the JSON canonical
    /// for any given options type.
    pub fn key_for<T: Serialize>(options: &T) -> String {
        let json = serde_json::to_vec(options).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&json);
        format!("{:x}", hasher.finalize())
    }

    pub fn get(&self, key: &str) -> Option<Vec<ScoredMemory>> {
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > Instant::now() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.results.clone());
            }
        }
        // Expired entries are removed on the way out.
        self.entries
            .remove_if(key, |_, entry| entry.expires_at <= Instant::now());
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn insert(&self, key: String, results: Vec<ScoredMemory>) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);

        // Evict the entries closest to expiry until the bound holds.
        while self.entries.len() >= self.max_entries {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|kv| kv.value().expires_at)
                .map(|kv| kv.key().clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }

        self.entries.insert(
            key,
            CacheEntry {
                expires_at: now + self.ttl,
                results,
            },
        );
    }

    /// Full invalidation, called on every ChunkStore mutation.
    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheSettings;
    use crate::types::{Chunk, MemorySource};

    fn results(content: &str) -> Vec<ScoredMemory> {
        vec![ScoredMemory::from_chunk(
            &Chunk::new(content, MemorySource::Memory),
            0.9,
            "test",
        )]
    }

    fn cache(ttl_secs: u64, max_entries: usize) -> ResultCache {
        ResultCache::new(&CacheSettings {
            ttl_secs,
            max_entries,
        })
    }

    #[test]
    fn hit_and_miss() {
        let cache = cache(300, 10);
        let key = ResultCache::key_for(&("query", 5));
        assert!(cache.get(&key).is_none());
        cache.insert(key.clone(), results("cached"));
        let got = cache.get(&key).unwrap();
        assert_eq!(got[0].content, "cached");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn distinct_options_get_distinct_keys() {
        let a = ResultCache::key_for(&("query", 5, true));
        let b = ResultCache::key_for(&("query", 5, false));
        assert_ne!(a, b);
        assert_eq!(a, ResultCache::key_for(&("query", 5, true)));
    }

    #[test]
    fn zero_ttl_expires_immediately() {
        let cache = cache(0, 10);
        let key = ResultCache::key_for(&"q");
        cache.insert(key.clone(), results("gone"));
        assert!(cache.get(&key).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn size_bound_evicts_oldest_expiry() {
        let cache = cache(300, 3);
        for i in 0..3 {
            cache.insert(format!("k{}", i), results(&format!("v{}", i)));
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(cache.len(), 3);
        // k0 has the earliest expiry; inserting a fourth entry evicts it.
        cache.insert("k3".into(), results("v3"));
        assert_eq!(cache.len(), 3);
        assert!(cache.get("k0").is_none());
        assert!(cache.get("k3").is_some());
    }

    #[test]
    fn clear_empties_everything() {
        let cache = cache(300, 10);
        cache.insert("a".into(), results("x"));
        cache.insert("b".into(), results("y"));
        cache.clear();
        assert!(cache.is_empty());
    }
}
