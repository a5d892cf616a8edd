//! Chunk read cache
//!
//! Chunks are immutable once written, so this is a read-only LRU keyed by
//! content hash. The cache is an explicit object injected into
//! `ChunkStorage` with an explicit capacity; there is no process-wide
//! singleton.

use bytes::Bytes;
use parking_lot::RwLock;
use sediment_common::ChunkHash;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

struct CacheEntry {
    data: Bytes,
    last_access: AtomicU64,
}

impl CacheEntry {
    fn new(data: Bytes, clock: u64) -> Self {
        Self {
            data,
            last_access: AtomicU64::new(clock),
        }
    }

    fn touch(&self, clock: u64) {
        self.last_access.store(clock, Ordering::Relaxed);
    }
}

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
}

impl CacheStats {
    /// Hit ratio in [0.0, 1.0]
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }
}

/// LRU cache over decompressed chunk bytes
pub struct ChunkCache {
    entries: RwLock<HashMap<ChunkHash, CacheEntry>>,
    capacity: usize,
    clock: AtomicU64,
    stats: CacheStats,
}

impl ChunkCache {
    /// Create a cache holding at most `capacity` chunks
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity,
            clock: AtomicU64::new(0),
            stats: CacheStats::default(),
        }
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Look up a chunk by hash
    pub fn get(&self, hash: &ChunkHash) -> Option<Bytes> {
        let entries = self.entries.read();
        if let Some(entry) = entries.get(hash) {
            entry.touch(self.tick());
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            Some(entry.data.clone())
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Insert a chunk, evicting the least recently used entry at capacity
    pub fn insert(&self, hash: ChunkHash, data: Bytes) {
        if self.capacity == 0 {
            return;
        }
        let clock = self.tick();
        let mut entries = self.entries.write();
        while entries.len() >= self.capacity {
            let lru = entries
                .iter()
                .min_by_key(|(_, e)| e.last_access.load(Ordering::Relaxed))
                .map(|(k, _)| *k);
            match lru {
                Some(key) => {
                    entries.remove(&key);
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }
        entries.insert(hash, CacheEntry::new(data, clock));
    }

    /// Remove a chunk (called when GC deletes the backing object)
    pub fn invalidate(&self, hash: &ChunkHash) {
        self.entries.write().remove(hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(n: u8) -> ChunkHash {
        ChunkHash::from_bytes([n; 32])
    }

    #[test]
    fn test_cache_insert_and_get() {
        let cache = ChunkCache::new(16);
        cache.insert(hash(1), Bytes::from_static(b"one"));

        assert_eq!(cache.get(&hash(1)), Some(Bytes::from_static(b"one")));
        assert_eq!(cache.get(&hash(2)), None);
        assert_eq!(cache.stats().hits.load(Ordering::Relaxed), 1);
        assert_eq!(cache.stats().misses.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_cache_lru_eviction() {
        let cache = ChunkCache::new(2);
        cache.insert(hash(1), Bytes::from_static(b"one"));
        cache.insert(hash(2), Bytes::from_static(b"two"));

        // Touch 1 so 2 becomes the LRU entry
        cache.get(&hash(1));
        cache.insert(hash(3), Bytes::from_static(b"three"));

        assert!(cache.get(&hash(1)).is_some());
        assert!(cache.get(&hash(2)).is_none());
        assert!(cache.get(&hash(3)).is_some());
        assert_eq!(cache.stats().evictions.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_zero_capacity_cache_stores_nothing() {
        let cache = ChunkCache::new(0);
        cache.insert(hash(1), Bytes::from_static(b"one"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate() {
        let cache = ChunkCache::new(16);
        cache.insert(hash(1), Bytes::from_static(b"one"));
        cache.invalidate(&hash(1));
        assert!(cache.get(&hash(1)).is_none());
    }
}
