//! Cache configuration for user-configurable cache sizes and locations.
//!
//! Configuration can be loaded from a TOML file, environment variables,
//! or created programmatically.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{DiskCacheStore, MemoryCacheStore};

const MB: usize = 1024 * 1024;

/// Configuration for the byte caches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Memory cache size limit in bytes
    pub memory_cache_size: usize,
    /// Disk cache size limit in bytes
    pub disk_cache_size: usize,
    /// Directory path for disk cache storage
    pub disk_cache_dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_cache_size: 64 * MB,
            disk_cache_size: 256 * MB,
            disk_cache_dir: Self::default_cache_dir(),
        }
    }
}

impl CacheConfig {
    /// Sets the memory cache size in megabytes.
    pub fn with_memory_mb(mut self, mb: usize) -> Self {
        self.memory_cache_size = mb * MB;
        self
    }

    /// Sets the disk cache size in megabytes.
    pub fn with_disk_mb(mut self, mb: usize) -> Self {
        self.disk_cache_size = mb * MB;
        self
    }

    /// Sets the disk cache directory.
    pub fn with_disk_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.disk_cache_dir = path.as_ref().to_path_buf();
        self
    }

    /// Returns the default cache directory for the current platform.
    ///
    /// - macOS: ~/Library/Caches/image-loader/images
    /// - Linux: ~/.cache/image-loader/images
    /// - Windows: %LOCALAPPDATA%\image-loader\images
    pub fn default_cache_dir() -> PathBuf {
        if let Some(cache_dir) = dirs::cache_dir() {
            cache_dir.join("image-loader").join("images")
        } else {
            PathBuf::from("cache/images")
        }
    }

    /// Loads configuration from environment variables on top of the defaults.
    ///
    /// Environment variables:
    /// - `IMAGE_LOADER_MEMORY_CACHE_MB`: memory cache size in MB (default: 64)
    /// - `IMAGE_LOADER_DISK_CACHE_MB`: disk cache size in MB (default: 256)
    /// - `IMAGE_LOADER_CACHE_DIR`: disk cache directory path
    ///
    /// # Errors
    /// Returns an error if any environment variable contains an invalid value.
    pub fn from_env() -> Result<Self, CacheConfigError> {
        let mut config = Self::default();

        if let Some(mb) = env_mb("IMAGE_LOADER_MEMORY_CACHE_MB")? {
            config.memory_cache_size = mb * MB;
        }
        if let Some(mb) = env_mb("IMAGE_LOADER_DISK_CACHE_MB")? {
            config.disk_cache_size = mb * MB;
        }
        if let Ok(val) = std::env::var("IMAGE_LOADER_CACHE_DIR") {
            config.disk_cache_dir = PathBuf::from(val);
        }

        Ok(config)
    }

    /// Loads configuration from a TOML file. Missing keys keep their defaults.
    ///
    /// ```toml
    /// memory_cache_size = 67108864
    /// disk_cache_size = 268435456
    /// disk_cache_dir = "/path/to/cache"
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, CacheConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&contents)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, CacheConfigError> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Saves configuration to a TOML file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), CacheConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path.as_ref(), contents)?;
        Ok(())
    }

    /// Open a disk cache at the configured location and size, re-indexing
    /// whatever a previous run left there.
    pub fn open_disk_cache(&self) -> io::Result<DiskCacheStore> {
        let store = DiskCacheStore::new(&self.disk_cache_dir, self.disk_cache_size)?;
        store.load_from_disk()?;
        Ok(store)
    }

    /// Create a memory cache with the configured size.
    pub fn memory_cache(&self) -> MemoryCacheStore {
        MemoryCacheStore::new(self.memory_cache_size)
    }
}

fn env_mb(key: &str) -> Result<Option<usize>, CacheConfigError> {
    match std::env::var(key) {
        Ok(val) => val
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|_| CacheConfigError::InvalidValue(key.to_string())),
        Err(_) => Ok(None),
    }
}

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum CacheConfigError {
    /// Invalid value for a configuration parameter
    #[error("invalid value for configuration key: {0}")]
    InvalidValue(String),

    /// I/O error reading or writing configuration file
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed TOML
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Configuration could not be rendered as TOML
    #[error("serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
