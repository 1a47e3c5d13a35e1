//! Cache store contract shared by every byte-cache back-end.
//!
//! The scheduler never knows how bytes are persisted. It only asks a store
//! whether an entry for a raw key is fresh enough, and hands finished results
//! back for storage. Freshness is decided from the entry's write time and the
//! maximum age supplied by the caller, so stores carry no TTL policy of their own.

use std::io;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;

/// Result of looking up a raw key in a cache store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheStatus {
    /// Entry exists and was written within the requested maximum age
    Fresh(Arc<[u8]>),

    /// Entry exists but is older than the requested maximum age
    Stale(Arc<[u8]>),

    /// No entry for this key
    Miss,
}

impl CacheStatus {
    /// Classify an entry written at `written_at` against `max_age`, as seen at `now`.
    ///
    /// An entry stamped in the future (clock skew) is treated as fresh.
    pub fn classify(bytes: Arc<[u8]>, written_at: SystemTime, max_age: Duration, now: SystemTime) -> Self {
        match now.duration_since(written_at) {
            Ok(age) if age > max_age => CacheStatus::Stale(bytes),
            _ => CacheStatus::Fresh(bytes),
        }
    }

    /// Returns `true` for [`CacheStatus::Fresh`]
    pub fn is_fresh(&self) -> bool {
        matches!(self, CacheStatus::Fresh(_))
    }

    /// Returns `true` for [`CacheStatus::Miss`]
    pub fn is_miss(&self) -> bool {
        matches!(self, CacheStatus::Miss)
    }
}

/// Errors reported by cache stores
#[derive(Debug, Error)]
pub enum CacheError {
    /// I/O failure reading or writing an entry
    #[error("cache I/O error: {0}")]
    Io(#[from] io::Error),

    /// An entry on disk is shorter than its header
    #[error("corrupt cache entry for key {0}")]
    Corrupt(String),

    /// Entry is larger than the whole cache budget
    #[error("entry of {size} bytes exceeds cache limit of {limit} bytes")]
    TooLarge { size: usize, limit: usize },
}

/// Byte cache keyed by raw key.
///
/// Implementations must be safe for concurrent reads and writes from many
/// executor threads.
pub trait CacheStore: Send + Sync {
    /// Look up `raw_key`, classifying the entry against `max_age`.
    fn get(&self, raw_key: &str, max_age: Duration) -> Result<CacheStatus, CacheError>;

    /// Store `bytes` for `raw_key`, recording `written_at` as its write time.
    ///
    /// An existing entry for the same key is replaced.
    fn put(&self, raw_key: &str, bytes: &[u8], written_at: SystemTime) -> Result<(), CacheError>;

    /// Remove the entry for `raw_key`. Removing a missing key is not an error.
    fn remove(&self, raw_key: &str) -> Result<(), CacheError>;

    /// Check whether any entry (fresh or stale) exists for `raw_key`.
    fn contains(&self, raw_key: &str) -> bool;
}

/// Milliseconds since the unix epoch, saturating at zero for pre-epoch times.
pub(crate) fn to_unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) fn from_unix_millis(millis: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes() -> Arc<[u8]> {
        Arc::from(vec![1u8, 2, 3])
    }

    #[test]
    fn test_classify_fresh_within_max_age() {
        let now = SystemTime::now();
        let written = now - Duration::from_secs(10);
        let status = CacheStatus::classify(bytes(), written, Duration::from_secs(60), now);
        assert!(status.is_fresh());
    }

    #[test]
    fn test_classify_stale_past_max_age() {
        let now = SystemTime::now();
        let written = now - Duration::from_secs(120);
        let status = CacheStatus::classify(bytes(), written, Duration::from_secs(60), now);
        assert_eq!(status, CacheStatus::Stale(bytes()));
    }

    #[test]
    fn test_classify_future_write_is_fresh() {
        let now = SystemTime::now();
        let written = now + Duration::from_secs(30);
        let status = CacheStatus::classify(bytes(), written, Duration::ZERO, now);
        assert!(status.is_fresh());
    }

    #[test]
    fn test_unix_millis_conversion() {
        let time = UNIX_EPOCH + Duration::from_millis(1_700_000_000_123);
        assert_eq!(from_unix_millis(to_unix_millis(time)), time);
        assert_eq!(to_unix_millis(UNIX_EPOCH - Duration::from_secs(5)), 0);
    }
}
