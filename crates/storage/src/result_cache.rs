//! Bounded cache of prior query results.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A cached query result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResult {
    pub row_count: u64,
    pub payload: Vec<u8>,
}

/// Hit/miss counters snapshot.
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub len: usize,
}

/// LRU cache keyed by a canonical query string.
pub struct ResultCacheManager {
    cache: Mutex<LruCache<String, Arc<CachedResult>>>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResultCacheManager {
    pub fn new(cache_num: usize) -> Self {
        let capacity = cache_num.max(1);
        ResultCacheManager {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).expect("capacity clamped to >= 1"),
            )),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, query_key: &str) -> Option<Arc<CachedResult>> {
        let result = self.cache.lock().get(query_key).cloned();
        match &result {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    pub fn put(&self, query_key: impl Into<String>, result: CachedResult) {
        self.cache.lock().put(query_key.into(), Arc::new(result));
    }

    pub fn invalidate(&self, query_key: &str) {
        self.cache.lock().pop(query_key);
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            len: self.len(),
        }
    }
}
