//! Image Loader Cache Library
//!
//! Byte caches consulted by the image loading scheduler before any fetch or
//! decode work runs. The [`CacheStore`] trait is the only thing the scheduler
//! depends on; [`MemoryCacheStore`] and [`DiskCacheStore`] are the stock
//! implementations, both with LRU eviction by total bytes.
//!
//! Entries carry the time they were written. Callers pass the maximum age they
//! accept on every lookup, which is how the scheduler's disk cache duration is
//! enforced.
//!
//! # Example
//!
//! ```
//! use image_loader_cache::{CacheStatus, CacheStore, MemoryCacheStore};
//! use std::time::{Duration, SystemTime};
//!
//! let cache = MemoryCacheStore::with_mb_limit(4);
//! cache.put("https://example.com/cat.png", b"png bytes", SystemTime::now()).unwrap();
//!
//! let status = cache.get("https://example.com/cat.png", Duration::from_secs(60)).unwrap();
//! assert!(matches!(status, CacheStatus::Fresh(_)));
//! ```

pub mod config;
pub mod disk;
pub mod ram;
pub mod store;

pub use config::{CacheConfig, CacheConfigError};
pub use disk::{DiskCacheStats, DiskCacheStore};
pub use ram::{MemoryCacheStats, MemoryCacheStore};
pub use store::{CacheError, CacheStatus, CacheStore};
