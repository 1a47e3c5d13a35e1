//! RAM byte cache with LRU eviction
//!
//! Keeps encoded image bytes in memory, keyed by raw key, and evicts the
//! least recently used entries once the byte budget is exceeded.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;

use crate::store::{CacheError, CacheStatus, CacheStore};

/// Statistics about memory cache usage
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryCacheStats {
    /// Number of entries currently in cache
    pub entry_count: usize,

    /// Total bytes held by cached entries
    pub memory_used: usize,

    /// Maximum bytes allowed
    pub memory_limit: usize,

    /// Lookups that found a fresh entry
    pub hits: u64,

    /// Lookups that found an expired entry
    pub stale: u64,

    /// Lookups that found nothing
    pub misses: u64,

    /// Entries evicted due to memory pressure
    pub evictions: u64,
}

impl MemoryCacheStats {
    /// Calculate the fresh-hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.stale + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Entry {
    bytes: Arc<[u8]>,
    written_at: SystemTime,
}

struct CacheState {
    entries: HashMap<String, Entry>,

    /// Most recently used at back
    lru_queue: VecDeque<String>,

    stats: MemoryCacheStats,
}

impl CacheState {
    fn touch(&mut self, key: &str) {
        self.lru_queue.retain(|k| k != key);
        self.lru_queue.push_back(key.to_string());
    }

    fn remove_entry(&mut self, key: &str) {
        if let Some(entry) = self.entries.remove(key) {
            self.stats.memory_used = self.stats.memory_used.saturating_sub(entry.bytes.len());
            self.lru_queue.retain(|k| k != key);
            self.stats.entry_count = self.entries.len();
        }
    }

    fn evict_lru(&mut self) {
        if let Some(key) = self.lru_queue.pop_front() {
            if let Some(entry) = self.entries.remove(&key) {
                self.stats.memory_used = self.stats.memory_used.saturating_sub(entry.bytes.len());
                self.stats.entry_count = self.entries.len();
                self.stats.evictions += 1;
            }
        }
    }
}

/// In-memory [`CacheStore`] bounded by total bytes.
///
/// Cloning yields another handle to the same cache.
#[derive(Clone)]
pub struct MemoryCacheStore {
    state: Arc<Mutex<CacheState>>,
}

impl MemoryCacheStore {
    /// Create a memory cache holding at most `memory_limit` bytes
    pub fn new(memory_limit: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(CacheState {
                entries: HashMap::new(),
                lru_queue: VecDeque::new(),
                stats: MemoryCacheStats {
                    memory_limit,
                    ..Default::default()
                },
            })),
        }
    }

    /// Create a memory cache with the limit given in megabytes
    pub fn with_mb_limit(megabytes: usize) -> Self {
        Self::new(megabytes * 1024 * 1024)
    }

    /// Current statistics
    pub fn stats(&self) -> MemoryCacheStats {
        self.state.lock().stats
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Drop every entry
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.lru_queue.clear();
        state.stats.entry_count = 0;
        state.stats.memory_used = 0;
    }
}

impl CacheStore for MemoryCacheStore {
    fn get(&self, raw_key: &str, max_age: Duration) -> Result<CacheStatus, CacheError> {
        let mut state = self.state.lock();

        let Some(entry) = state.entries.get(raw_key) else {
            state.stats.misses += 1;
            return Ok(CacheStatus::Miss);
        };

        let status =
            CacheStatus::classify(entry.bytes.clone(), entry.written_at, max_age, SystemTime::now());
        if status.is_fresh() {
            state.stats.hits += 1;
        } else {
            state.stats.stale += 1;
        }
        state.touch(raw_key);

        Ok(status)
    }

    fn put(&self, raw_key: &str, bytes: &[u8], written_at: SystemTime) -> Result<(), CacheError> {
        let mut state = self.state.lock();
        let limit = state.stats.memory_limit;
        if bytes.len() > limit {
            return Err(CacheError::TooLarge {
                size: bytes.len(),
                limit,
            });
        }

        state.remove_entry(raw_key);
        while state.stats.memory_used + bytes.len() > limit && !state.lru_queue.is_empty() {
            state.evict_lru();
        }

        state.entries.insert(
            raw_key.to_string(),
            Entry {
                bytes: Arc::from(bytes),
                written_at,
            },
        );
        state.lru_queue.push_back(raw_key.to_string());
        state.stats.memory_used += bytes.len();
        state.stats.entry_count = state.entries.len();

        Ok(())
    }

    fn remove(&self, raw_key: &str) -> Result<(), CacheError> {
        self.state.lock().remove_entry(raw_key);
        Ok(())
    }

    fn contains(&self, raw_key: &str) -> bool {
        self.state.lock().entries.contains_key(raw_key)
    }
}
