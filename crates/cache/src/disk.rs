//! Persistent disk cache for encoded image bytes with LRU eviction.
//!
//! Each entry lives in its own file, named by the SHA-256 digest of the raw
//! key so that arbitrary keys (URLs, transformation chains) map to safe
//! filenames. The file starts with a small header recording when the entry
//! was written and the original raw key, which lets `load_from_disk` rebuild
//! the index after a restart and lets lookups classify entries as fresh or
//! stale without touching file metadata.
//!
//! File layout:
//!
//! ```text
//! [written_at: u64 LE unix millis][key_len: u32 LE][key bytes][payload bytes]
//! ```

use std::collections::{HashMap, VecDeque};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::store::{from_unix_millis, to_unix_millis, CacheError, CacheStatus, CacheStore};

const ENTRY_EXTENSION: &str = "img";
const FIXED_HEADER_LEN: usize = 8 + 4;

/// Statistics for monitoring disk cache performance
#[derive(Debug, Clone, Default)]
pub struct DiskCacheStats {
    /// Lookups that found a fresh entry
    pub hits: u64,
    /// Lookups that found an expired entry
    pub stale: u64,
    /// Lookups that found nothing
    pub misses: u64,
    /// Number of entries evicted to free space
    pub evictions: u64,
    /// Total number of entries in cache
    pub entry_count: usize,
    /// Total disk space used in bytes (headers included)
    pub disk_used: usize,
}

impl DiskCacheStats {
    /// Calculate the fresh-hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.stale + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Calculate disk utilization (0.0 to 1.0)
    pub fn disk_utilization(&self, limit: usize) -> f64 {
        if limit == 0 {
            0.0
        } else {
            self.disk_used as f64 / limit as f64
        }
    }
}

#[derive(Debug, Clone)]
struct DiskEntry {
    path: PathBuf,
    file_size: usize,
}

struct CacheState {
    entries: HashMap<String, DiskEntry>,
    /// LRU queue: front = least recently used, back = most recently used
    lru_queue: VecDeque<String>,
    stats: DiskCacheStats,
    disk_limit: usize,
    cache_dir: PathBuf,
}

impl CacheState {
    fn touch(&mut self, key: &str) {
        self.lru_queue.retain(|k| k != key);
        self.lru_queue.push_back(key.to_string());
    }

    fn forget(&mut self, key: &str) -> Option<DiskEntry> {
        let entry = self.entries.remove(key)?;
        self.lru_queue.retain(|k| k != key);
        self.stats.disk_used = self.stats.disk_used.saturating_sub(entry.file_size);
        self.stats.entry_count = self.entries.len();
        Some(entry)
    }

    fn evict_lru(&mut self) -> io::Result<()> {
        if let Some(key) = self.lru_queue.pop_front() {
            if let Some(entry) = self.entries.remove(&key) {
                remove_file_if_exists(&entry.path)?;
                self.stats.disk_used = self.stats.disk_used.saturating_sub(entry.file_size);
                self.stats.entry_count = self.entries.len();
                self.stats.evictions += 1;
            }
        }
        Ok(())
    }

    fn evict_until_space_available(&mut self, needed_space: usize) -> io::Result<()> {
        while self.stats.disk_used + needed_space > self.disk_limit && !self.lru_queue.is_empty() {
            self.evict_lru()?;
        }
        Ok(())
    }
}

fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Persistent [`CacheStore`] backed by one file per entry.
///
/// Thread-safe for concurrent access from multiple executor threads; cloning
/// yields another handle to the same cache.
#[derive(Clone)]
pub struct DiskCacheStore {
    state: Arc<Mutex<CacheState>>,
}

impl DiskCacheStore {
    /// Create a new disk cache with specified cache directory and disk limit in bytes
    pub fn new<P: AsRef<Path>>(cache_dir: P, disk_limit: usize) -> io::Result<Self> {
        let cache_dir = cache_dir.as_ref().to_path_buf();
        fs::create_dir_all(&cache_dir)?;

        let state = CacheState {
            entries: HashMap::new(),
            lru_queue: VecDeque::new(),
            stats: DiskCacheStats::default(),
            disk_limit,
            cache_dir,
        };

        Ok(Self {
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// Create a new disk cache with disk limit specified in megabytes
    pub fn with_mb_limit<P: AsRef<Path>>(cache_dir: P, megabytes: usize) -> io::Result<Self> {
        Self::new(cache_dir, megabytes * 1024 * 1024)
    }

    /// Filename for a raw key: SHA-256 hex digest plus extension
    pub fn file_name_for(raw_key: &str) -> String {
        let digest = Sha256::digest(raw_key.as_bytes());
        format!("{:x}.{}", digest, ENTRY_EXTENSION)
    }

    fn read_entry(path: &Path) -> Result<(SystemTime, String, Vec<u8>), CacheError> {
        let mut file = File::open(path)?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;

        let corrupt = || CacheError::Corrupt(path.display().to_string());
        if contents.len() < FIXED_HEADER_LEN {
            return Err(corrupt());
        }

        let mut millis = [0u8; 8];
        millis.copy_from_slice(&contents[..8]);
        let mut key_len = [0u8; 4];
        key_len.copy_from_slice(&contents[8..12]);
        let key_len = u32::from_le_bytes(key_len) as usize;

        let payload_start = FIXED_HEADER_LEN + key_len;
        if contents.len() < payload_start {
            return Err(corrupt());
        }
        let key = String::from_utf8(contents[FIXED_HEADER_LEN..payload_start].to_vec())
            .map_err(|_| corrupt())?;
        let payload = contents.split_off(payload_start);

        Ok((from_unix_millis(u64::from_le_bytes(millis)), key, payload))
    }

    /// Drop every entry and its file
    pub fn clear(&self) -> io::Result<()> {
        let mut state = self.state.lock();
        for (_key, entry) in state.entries.drain() {
            fs::remove_file(&entry.path).ok();
        }
        state.lru_queue.clear();
        state.stats.entry_count = 0;
        state.stats.disk_used = 0;
        Ok(())
    }

    /// Get current cache statistics
    pub fn stats(&self) -> DiskCacheStats {
        self.state.lock().stats.clone()
    }

    /// Get disk space limit in bytes
    pub fn disk_limit(&self) -> usize {
        self.state.lock().disk_limit
    }

    /// Update disk space limit
    ///
    /// If the new limit is lower than current usage, evicts entries until within limit.
    pub fn set_disk_limit(&self, new_limit: usize) -> io::Result<()> {
        let mut state = self.state.lock();
        state.disk_limit = new_limit;
        while state.stats.disk_used > state.disk_limit && !state.lru_queue.is_empty() {
            state.evict_lru()?;
        }
        Ok(())
    }

    /// Get cache directory path
    pub fn cache_dir(&self) -> PathBuf {
        self.state.lock().cache_dir.clone()
    }

    /// Rebuild the index from entry files already present in the cache directory.
    ///
    /// Files that cannot be parsed are deleted. Recovered entries start in
    /// directory order for LRU purposes.
    pub fn load_from_disk(&self) -> io::Result<usize> {
        let mut state = self.state.lock();
        state.entries.clear();
        state.lru_queue.clear();
        state.stats.entry_count = 0;
        state.stats.disk_used = 0;

        for dir_entry in fs::read_dir(&state.cache_dir)? {
            let path = dir_entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }

            match Self::read_entry(&path) {
                Ok((_written_at, key, payload)) => {
                    let file_size = FIXED_HEADER_LEN + key.len() + payload.len();
                    state.lru_queue.push_back(key.clone());
                    state.entries.insert(key, DiskEntry { path, file_size });
                    state.stats.disk_used += file_size;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "dropping unreadable cache entry");
                    remove_file_if_exists(&path)?;
                }
            }
        }

        state.stats.entry_count = state.entries.len();
        debug!(entries = state.entries.len(), "disk cache index rebuilt");
        Ok(state.entries.len())
    }
}

impl CacheStore for DiskCacheStore {
    fn get(&self, raw_key: &str, max_age: Duration) -> Result<CacheStatus, CacheError> {
        let mut state = self.state.lock();

        let Some(entry) = state.entries.get(raw_key).cloned() else {
            state.stats.misses += 1;
            return Ok(CacheStatus::Miss);
        };

        let (written_at, _key, payload) = match Self::read_entry(&entry.path) {
            Ok(parsed) => parsed,
            Err(CacheError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                // File vanished underneath us
                state.forget(raw_key);
                state.stats.misses += 1;
                return Ok(CacheStatus::Miss);
            }
            Err(e) => return Err(e),
        };

        let status =
            CacheStatus::classify(Arc::from(payload), written_at, max_age, SystemTime::now());
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

        let file_size = FIXED_HEADER_LEN + raw_key.len() + bytes.len();
        if file_size > state.disk_limit {
            return Err(CacheError::TooLarge {
                size: file_size,
                limit: state.disk_limit,
            });
        }

        if let Some(old) = state.forget(raw_key) {
            fs::remove_file(&old.path).ok();
        }
        state.evict_until_space_available(file_size)?;

        let path = state.cache_dir.join(Self::file_name_for(raw_key));
        let mut file = File::create(&path)?;
        file.write_all(&to_unix_millis(written_at).to_le_bytes())?;
        file.write_all(&(raw_key.len() as u32).to_le_bytes())?;
        file.write_all(raw_key.as_bytes())?;
        file.write_all(bytes)?;
        file.sync_all()?;

        state
            .entries
            .insert(raw_key.to_string(), DiskEntry { path, file_size });
        state.lru_queue.push_back(raw_key.to_string());
        state.stats.disk_used += file_size;
        state.stats.entry_count = state.entries.len();

        Ok(())
    }

    fn remove(&self, raw_key: &str) -> Result<(), CacheError> {
        let mut state = self.state.lock();
        if let Some(entry) = state.forget(raw_key) {
            remove_file_if_exists(&entry.path)?;
        }
        Ok(())
    }

    fn contains(&self, raw_key: &str) -> bool {
        self.state.lock().entries.contains_key(raw_key)
    }
}
