//! Scheduler configuration.
//!
//! Configuration can be loaded from a TOML file, environment variables,
//! or created programmatically. The slot-count factory can only be set in
//! code.

use std::fmt;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, SchedulerError};

/// Error type a slot-count factory may return
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Computes the slot count at admission time
///
/// Non-positive results, errors and panics all fall back to
/// [`SchedulerConfig::max_parallel_tasks`].
pub type MaxSlotsFactory = Arc<dyn Fn(&SchedulerConfig) -> Result<i64, BoxError> + Send + Sync>;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Tunables for the dispatcher.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Fixed concurrency bound used when no factory is set (or it fails)
    pub max_parallel_tasks: usize,

    /// Optional dynamic concurrency bound, evaluated on every admission pass
    #[serde(skip)]
    pub max_parallel_tasks_factory: Option<MaxSlotsFactory>,

    /// Age after which cached entries count as stale
    #[serde(rename = "disk_cache_duration_secs", with = "duration_secs")]
    pub disk_cache_duration: Duration,

    /// Deliver completion callbacks on a single designated thread
    pub deliver_on_designated_thread: bool,

    /// Pause between admission and execution
    #[serde(rename = "delay_before_start_ms", with = "duration_millis")]
    pub delay_before_start: Duration,

    /// Master switch for diagnostic output
    pub verbose_logging: bool,

    /// Per-task timing output (requires `verbose_logging`)
    pub verbose_performance_logging: bool,

    /// Cache hit/miss output (requires `verbose_logging`)
    pub verbose_memory_cache_logging: bool,

    /// Cancellation output (requires `verbose_logging`)
    pub verbose_loading_cancelled_logging: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel_tasks: Self::default_max_parallel_tasks(),
            max_parallel_tasks_factory: None,
            disk_cache_duration: 30 * DAY,
            deliver_on_designated_thread: false,
            delay_before_start: Duration::ZERO,
            verbose_logging: false,
            verbose_performance_logging: false,
            verbose_memory_cache_logging: false,
            verbose_loading_cancelled_logging: false,
        }
    }
}

impl fmt::Debug for SchedulerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerConfig")
            .field("max_parallel_tasks", &self.max_parallel_tasks)
            .field(
                "max_parallel_tasks_factory",
                &self.max_parallel_tasks_factory.as_ref().map(|_| "<fn>"),
            )
            .field("disk_cache_duration", &self.disk_cache_duration)
            .field("deliver_on_designated_thread", &self.deliver_on_designated_thread)
            .field("delay_before_start", &self.delay_before_start)
            .field("verbose_logging", &self.verbose_logging)
            .field("verbose_performance_logging", &self.verbose_performance_logging)
            .field("verbose_memory_cache_logging", &self.verbose_memory_cache_logging)
            .field(
                "verbose_loading_cancelled_logging",
                &self.verbose_loading_cancelled_logging,
            )
            .finish()
    }
}

impl SchedulerConfig {
    /// Half the logical cores, clamped to `2..=4`
    pub fn default_max_parallel_tasks() -> usize {
        let cores = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        (cores / 2).clamp(2, 4)
    }

    /// Sets the fixed concurrency bound.
    pub fn with_max_parallel_tasks(mut self, max: usize) -> Self {
        self.max_parallel_tasks = max;
        self
    }

    /// Sets a factory that computes the concurrency bound at admission time.
    pub fn with_max_parallel_tasks_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&SchedulerConfig) -> Result<i64, BoxError> + Send + Sync + 'static,
    {
        self.max_parallel_tasks_factory = Some(Arc::new(factory));
        self
    }

    /// Sets the cache freshness window.
    pub fn with_disk_cache_duration(mut self, duration: Duration) -> Self {
        self.disk_cache_duration = duration;
        self
    }

    /// Route completion callbacks through a single designated thread.
    pub fn with_delivery_on_designated_thread(mut self, enabled: bool) -> Self {
        self.deliver_on_designated_thread = enabled;
        self
    }

    /// Sets the pause between admission and execution.
    pub fn with_delay_before_start(mut self, delay: Duration) -> Self {
        self.delay_before_start = delay;
        self
    }

    /// Turns every diagnostic category on or off.
    pub fn with_verbose_logging(mut self, enabled: bool) -> Self {
        self.verbose_logging = enabled;
        self.verbose_performance_logging = enabled;
        self.verbose_memory_cache_logging = enabled;
        self.verbose_loading_cancelled_logging = enabled;
        self
    }

    /// Resolve the concurrency bound for one admission pass
    ///
    /// Uses the factory if present and it returns a positive value, the
    /// fixed bound otherwise, never less than 1. Factory errors, panics and
    /// non-positive values come back as [`SchedulerError::Configuration`]
    /// alongside the fallback so the caller can report them.
    pub fn resolve_max_slots(&self) -> (usize, Option<SchedulerError>) {
        let fixed = self.max_parallel_tasks.max(1);
        let Some(factory) = &self.max_parallel_tasks_factory else {
            return (fixed, None);
        };

        let problem = match panic::catch_unwind(AssertUnwindSafe(|| factory(self))) {
            Ok(Ok(n)) if n > 0 => match usize::try_from(n) {
                Ok(n) => return (n, None),
                Err(_) => format!("slot factory returned out-of-range value {}", n),
            },
            Ok(Ok(n)) => format!("slot factory returned non-positive value {}", n),
            Ok(Err(err)) => format!("slot factory failed: {}", err),
            Err(_) => "slot factory panicked".to_string(),
        };

        (fixed, Some(SchedulerError::Configuration(problem)))
    }

    /// The concurrency bound for one admission pass, logging any factory
    /// problem before falling back
    pub fn effective_max_slots(&self) -> usize {
        let (slots, problem) = self.resolve_max_slots();
        if let Some(err) = problem {
            warn!(error = %err, fallback = slots, "using fixed max_parallel_tasks");
        }
        slots
    }

    pub fn logs_performance(&self) -> bool {
        self.verbose_logging && self.verbose_performance_logging
    }

    pub fn logs_memory_cache(&self) -> bool {
        self.verbose_logging && self.verbose_memory_cache_logging
    }

    pub fn logs_cancellation(&self) -> bool {
        self.verbose_logging && self.verbose_loading_cancelled_logging
    }

    /// Loads configuration from environment variables on top of the defaults.
    ///
    /// Environment variables:
    /// - `IMAGE_LOADER_MAX_PARALLEL_TASKS`: fixed concurrency bound
    /// - `IMAGE_LOADER_DISK_CACHE_DAYS`: freshness window in days (default: 30)
    /// - `IMAGE_LOADER_DELIVER_ON_DESIGNATED_THREAD`: `true`/`false`/`1`/`0`
    /// - `IMAGE_LOADER_DELAY_MS`: pause before execution in milliseconds
    /// - `IMAGE_LOADER_VERBOSE`: turn all diagnostic output on or off
    ///
    /// # Errors
    /// Returns an error if any environment variable contains an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(max) = env_parse::<usize>("IMAGE_LOADER_MAX_PARALLEL_TASKS")? {
            config.max_parallel_tasks = max;
        }
        if let Some(days) = env_parse::<u64>("IMAGE_LOADER_DISK_CACHE_DAYS")? {
            config.disk_cache_duration = DAY * u32::try_from(days).map_err(|_| {
                ConfigError::InvalidValue("IMAGE_LOADER_DISK_CACHE_DAYS".to_string())
            })?;
        }
        if let Some(enabled) = env_bool("IMAGE_LOADER_DELIVER_ON_DESIGNATED_THREAD")? {
            config.deliver_on_designated_thread = enabled;
        }
        if let Some(ms) = env_parse::<u64>("IMAGE_LOADER_DELAY_MS")? {
            config.delay_before_start = Duration::from_millis(ms);
        }
        if let Some(enabled) = env_bool("IMAGE_LOADER_VERBOSE")? {
            config = config.with_verbose_logging(enabled);
        }

        Ok(config)
    }

    /// Loads configuration from a TOML file. Missing keys keep their defaults.
    ///
    /// ```toml
    /// max_parallel_tasks = 4
    /// disk_cache_duration_secs = 2592000
    /// deliver_on_designated_thread = true
    /// delay_before_start_ms = 10
    /// verbose_logging = false
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&contents)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Saves configuration to a TOML file. The factory is not persisted.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path.as_ref(), contents)?;
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(val) => val
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        Err(_) => Ok(None),
    }
}

fn env_bool(key: &str) -> Result<Option<bool>, ConfigError> {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidValue(key.to_string())),
        },
        Err(_) => Ok(None),
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
