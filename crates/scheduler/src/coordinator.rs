//! Cache lookup and in-flight deduplication in front of the executor.
//!
//! Before a task runs, the coordinator answers from the cache if it can and
//! otherwise checks whether an identical request (same raw key) is already
//! executing. Tasks that find one attach to it as observers and receive its
//! result instead of doing the work again. The registry and the observer
//! lists share one lock, so attaching to an owner and that owner finishing
//! can never interleave: an observer either attaches before the owner
//! releases its entry and gets the shared result, or arrives after and goes
//! through the cache.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use image_loader_cache::{CacheError, CacheStatus, CacheStore};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::panic_message;
use crate::task::{ImageData, Task, TaskId};

/// Result of consulting the cache for a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    /// Usable entry; the task can complete without running
    Fresh(ImageData),
    /// Expired entry; the task must run, the bytes are a revalidation hint
    Stale(ImageData),
    /// Nothing cached
    Miss,
    /// The task was attached as an observer to the in-flight owner with this id
    InFlight(TaskId),
}

/// Result of trying to become the executing owner for a raw key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InFlightClaim {
    /// The task now owns the key (or has no key) and should execute
    Owner,
    /// Another task owns the key; this task was attached to it
    Attached(TaskId),
}

struct InFlightEntry {
    owner: Arc<Task>,
    observers: Vec<Arc<Task>>,
}

/// Front door to the cache stores plus the in-flight registry
pub struct CacheCoordinator {
    store: Arc<dyn CacheStore>,
    max_age: Duration,
    log_cache: bool,
    in_flight: Mutex<HashMap<String, InFlightEntry>>,
}

impl CacheCoordinator {
    /// Create a coordinator over `store`; entries older than `max_age` are stale
    pub fn new(store: Arc<dyn CacheStore>, max_age: Duration) -> Self {
        Self {
            store,
            max_age,
            log_cache: false,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Emit per-lookup debug output
    pub fn with_cache_logging(mut self, enabled: bool) -> Self {
        self.log_cache = enabled;
        self
    }

    /// Maximum age before an entry is considered stale
    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Consult the in-flight registry, then the cache store
    ///
    /// Tasks without a raw key always miss. A store error or panic is logged
    /// and treated as a miss.
    pub fn lookup(&self, task: &Arc<Task>) -> CacheLookup {
        let Some(raw_key) = task.raw_key() else {
            return CacheLookup::Miss;
        };

        if let Some(owner) = self.try_attach(task) {
            return CacheLookup::InFlight(owner);
        }

        let status = panic::catch_unwind(AssertUnwindSafe(|| self.store.get(raw_key, self.max_age)))
            .unwrap_or_else(|payload| {
                warn!(
                    task = task.id(),
                    raw_key,
                    panic = %panic_message(payload.as_ref()),
                    "cache store panicked on lookup, treating as miss"
                );
                Ok(CacheStatus::Miss)
            });
        match status {
            Ok(CacheStatus::Fresh(bytes)) => {
                if self.log_cache {
                    debug!(task = task.id(), raw_key, size = bytes.len(), "cache hit");
                }
                CacheLookup::Fresh(ImageData::from(bytes))
            }
            Ok(CacheStatus::Stale(bytes)) => {
                if self.log_cache {
                    debug!(task = task.id(), raw_key, "cache entry expired");
                }
                CacheLookup::Stale(ImageData::from(bytes))
            }
            Ok(CacheStatus::Miss) => {
                if self.log_cache {
                    debug!(task = task.id(), raw_key, "cache miss");
                }
                CacheLookup::Miss
            }
            Err(err) => {
                warn!(task = task.id(), raw_key, error = %err, "cache lookup failed, treating as miss");
                CacheLookup::Miss
            }
        }
    }

    /// Attach `task` to a live in-flight owner of the same raw key
    ///
    /// Owners with a pending cancellation are not attachable, since their
    /// result will never be delivered. Returns the owner's id on success.
    pub fn try_attach(&self, task: &Arc<Task>) -> Option<TaskId> {
        let raw_key = task.raw_key()?;
        let mut in_flight = self.in_flight.lock();
        let entry = in_flight.get_mut(raw_key)?;
        if entry.owner.id() == task.id() || entry.owner.is_cancel_requested() {
            return None;
        }

        entry.observers.push(task.clone());
        Some(entry.owner.id())
    }

    /// Register `task` as the executing owner of its raw key
    ///
    /// If a live owner already exists, `task` is attached to it instead. If
    /// the current owner has been cancelled, `task` takes over ownership
    /// together with any observers still waiting.
    pub fn claim(&self, task: &Arc<Task>) -> InFlightClaim {
        let Some(raw_key) = task.raw_key() else {
            return InFlightClaim::Owner;
        };

        let mut in_flight = self.in_flight.lock();
        match in_flight.get_mut(raw_key) {
            Some(entry) if entry.owner.id() == task.id() => InFlightClaim::Owner,
            Some(entry) if !entry.owner.is_cancel_requested() => {
                entry.observers.push(task.clone());
                InFlightClaim::Attached(entry.owner.id())
            }
            Some(entry) => {
                debug!(
                    raw_key,
                    previous = entry.owner.id(),
                    owner = task.id(),
                    observers = entry.observers.len(),
                    "taking over in-flight key from cancelled owner"
                );
                entry.owner = task.clone();
                InFlightClaim::Owner
            }
            None => {
                in_flight.insert(
                    raw_key.to_string(),
                    InFlightEntry {
                        owner: task.clone(),
                        observers: Vec::new(),
                    },
                );
                InFlightClaim::Owner
            }
        }
    }

    /// Remove `owner`'s registry entry and return its observers in attach order
    ///
    /// Returns nothing if `owner` does not own its key (it never claimed it,
    /// or ownership passed to another task).
    pub fn release(&self, owner: &Task) -> Vec<Arc<Task>> {
        let Some(raw_key) = owner.raw_key() else {
            return Vec::new();
        };

        let mut in_flight = self.in_flight.lock();
        match in_flight.get(raw_key) {
            Some(entry) if entry.owner.id() == owner.id() => in_flight
                .remove(raw_key)
                .map(|entry| entry.observers)
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// Detach an observer, e.g. because it was cancelled while waiting
    ///
    /// Returns whether the task was attached.
    pub fn detach(&self, task: &Task) -> bool {
        let Some(raw_key) = task.raw_key() else {
            return false;
        };

        let mut in_flight = self.in_flight.lock();
        let Some(entry) = in_flight.get_mut(raw_key) else {
            return false;
        };
        let before = entry.observers.len();
        entry.observers.retain(|observer| observer.id() != task.id());
        entry.observers.len() != before
    }

    /// Detach a waiting observer by id, returning it if found
    pub fn take_observer(&self, id: TaskId) -> Option<Arc<Task>> {
        let mut in_flight = self.in_flight.lock();
        for entry in in_flight.values_mut() {
            if let Some(pos) = entry.observers.iter().position(|o| o.id() == id) {
                return Some(entry.observers.remove(pos));
            }
        }
        None
    }

    /// Flag and detach every waiting observer that targets the same
    /// destination as `task`
    pub fn cancel_observers_sharing_target(&self, task: &Task) -> Vec<Arc<Task>> {
        if task.target().is_none() {
            return Vec::new();
        }

        let mut removed = Vec::new();
        let mut in_flight = self.in_flight.lock();
        for entry in in_flight.values_mut() {
            entry.observers.retain(|observer| {
                if observer.id() != task.id() && observer.uses_same_target(task) {
                    observer.request_cancel();
                    removed.push(observer.clone());
                    false
                } else {
                    true
                }
            });
        }
        removed
    }

    /// Whether `task` is currently waiting on an in-flight owner
    pub fn is_attached(&self, task: &Task) -> bool {
        let Some(raw_key) = task.raw_key() else {
            return false;
        };
        self.in_flight
            .lock()
            .get(raw_key)
            .is_some_and(|entry| entry.observers.iter().any(|o| o.id() == task.id()))
    }

    /// Number of raw keys currently executing
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Number of tasks waiting on in-flight owners
    pub fn observer_count(&self) -> usize {
        self.in_flight
            .lock()
            .values()
            .map(|entry| entry.observers.len())
            .sum()
    }

    /// Write a freshly produced result to the cache
    ///
    /// Failures and store panics are logged and otherwise ignored; the task
    /// result is still delivered.
    pub fn store_result(&self, raw_key: &str, image: &ImageData) {
        let written = panic::catch_unwind(AssertUnwindSafe(|| {
            self.store.put(raw_key, image.bytes(), SystemTime::now())
        }));
        let written = match written {
            Ok(written) => written,
            Err(payload) => {
                warn!(
                    raw_key,
                    panic = %panic_message(payload.as_ref()),
                    "cache store panicked on write, result not cached"
                );
                return;
            }
        };
        match written {
            Ok(()) => {
                if self.log_cache {
                    debug!(raw_key, size = image.len(), "stored result in cache");
                }
            }
            Err(err) => {
                warn!(raw_key, error = %err, "failed to write result to cache");
            }
        }
    }

    /// Drop any cached entry for `raw_key`
    pub fn invalidate(&self, raw_key: &str) -> Result<(), CacheError> {
        self.store.remove(raw_key)
    }

    /// Whether the store holds an entry for `raw_key` (fresh or stale)
    pub fn contains(&self, raw_key: &str) -> bool {
        self.store.contains(raw_key)
    }
}

impl fmt::Debug for CacheCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheCoordinator")
            .field("max_age", &self.max_age)
            .field("in_flight", &self.in_flight_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecutionError;
    use crate::executor::ExecutionContext;
    use crate::task::TaskRequest;
    use image_loader_cache::MemoryCacheStore;

    fn keyed(id: TaskId, key: &str) -> Arc<Task> {
        Task::new(
            id,
            TaskRequest::new(|_ctx: &ExecutionContext<'_>| -> Result<ImageData, ExecutionError> {
                Ok(ImageData::new(vec![0u8]))
            })
            .with_raw_key(key),
        )
    }

    fn coordinator() -> CacheCoordinator {
        let store = Arc::new(MemoryCacheStore::new(1024 * 1024));
        CacheCoordinator::new(store, Duration::from_secs(60))
    }

    #[test]
    fn test_lookup_miss_then_fresh() {
        let coordinator = coordinator();
        let task = keyed(1, "k");
        assert_eq!(coordinator.lookup(&task), CacheLookup::Miss);

        coordinator.store_result("k", &ImageData::new(vec![1u8, 2]));
        assert_eq!(
            coordinator.lookup(&task),
            CacheLookup::Fresh(ImageData::new(vec![1u8, 2]))
        );
        assert!(coordinator.contains("k"));
    }

    #[test]
    fn test_lookup_stale() {
        let store = Arc::new(MemoryCacheStore::new(1024));
        let written = SystemTime::now() - Duration::from_secs(120);
        store.put("k", &[5u8], written).unwrap();

        let coordinator = CacheCoordinator::new(store, Duration::from_secs(60));
        assert_eq!(
            coordinator.lookup(&keyed(1, "k")),
            CacheLookup::Stale(ImageData::new(vec![5u8]))
        );
    }

    #[test]
    fn test_unkeyed_task_always_misses_and_owns() {
        let coordinator = coordinator();
        let task = Task::new(
            1,
            TaskRequest::new(|_ctx: &ExecutionContext<'_>| -> Result<ImageData, ExecutionError> {
                Ok(ImageData::new(vec![0u8]))
            }),
        );
        assert_eq!(coordinator.lookup(&task), CacheLookup::Miss);
        assert_eq!(coordinator.claim(&task), InFlightClaim::Owner);
        assert_eq!(coordinator.in_flight_count(), 0);
    }

    #[test]
    fn test_claim_then_attach() {
        let coordinator = coordinator();
        let owner = keyed(1, "k");
        let observer = keyed(2, "k");

        assert_eq!(coordinator.claim(&owner), InFlightClaim::Owner);
        assert_eq!(coordinator.claim(&owner), InFlightClaim::Owner);
        assert_eq!(coordinator.lookup(&observer), CacheLookup::InFlight(1));
        assert!(coordinator.is_attached(&observer));
        assert_eq!(coordinator.observer_count(), 1);

        let observers = coordinator.release(&owner);
        assert_eq!(observers.len(), 1);
        assert_eq!(observers[0].id(), 2);
        assert_eq!(coordinator.in_flight_count(), 0);
    }

    #[test]
    fn test_observers_released_in_attach_order() {
        let coordinator = coordinator();
        let owner = keyed(1, "k");
        coordinator.claim(&owner);
        for id in 2..=5 {
            assert_eq!(coordinator.try_attach(&keyed(id, "k")), Some(1));
        }

        let ids: Vec<_> = coordinator.release(&owner).iter().map(|t| t.id()).collect();
        assert_eq!(ids, vec![2, 3, 4, 5]);
    }

    #[test]
    fn test_cancelled_owner_not_attachable() {
        let coordinator = coordinator();
        let owner = keyed(1, "k");
        coordinator.claim(&owner);
        owner.request_cancel();

        assert_eq!(coordinator.try_attach(&keyed(2, "k")), None);
    }

    #[test]
    fn test_claim_takes_over_from_cancelled_owner() {
        let coordinator = coordinator();
        let old_owner = keyed(1, "k");
        let waiting = keyed(2, "k");
        coordinator.claim(&old_owner);
        coordinator.try_attach(&waiting);
        old_owner.request_cancel();

        let new_owner = keyed(3, "k");
        assert_eq!(coordinator.claim(&new_owner), InFlightClaim::Owner);

        // The cancelled owner no longer owns anything.
        assert!(coordinator.release(&old_owner).is_empty());
        let ids: Vec<_> = coordinator
            .release(&new_owner)
            .iter()
            .map(|t| t.id())
            .collect();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn test_detach() {
        let coordinator = coordinator();
        let owner = keyed(1, "k");
        let observer = keyed(2, "k");
        coordinator.claim(&owner);
        coordinator.try_attach(&observer);

        assert!(coordinator.detach(&observer));
        assert!(!coordinator.detach(&observer));
        assert!(coordinator.release(&owner).is_empty());
    }

    #[test]
    fn test_cancel_observers_sharing_target() {
        let coordinator = coordinator();
        let view = Arc::new(0u8);
        let owner = keyed(1, "k");
        let observer = Task::new(
            2,
            TaskRequest::new(|_ctx: &ExecutionContext<'_>| -> Result<ImageData, ExecutionError> {
                Ok(ImageData::new(vec![0u8]))
            })
            .with_raw_key("k")
            .with_target(&view),
        );
        coordinator.claim(&owner);
        coordinator.try_attach(&observer);

        let newcomer = Task::new(
            3,
            TaskRequest::new(|_ctx: &ExecutionContext<'_>| -> Result<ImageData, ExecutionError> {
                Ok(ImageData::new(vec![0u8]))
            })
            .with_target(&view),
        );
        let removed = coordinator.cancel_observers_sharing_target(&newcomer);
        assert_eq!(removed.len(), 1);
        assert!(observer.is_cancel_requested());
        assert_eq!(coordinator.observer_count(), 0);
    }

    #[test]
    fn test_invalidate() {
        let coordinator = coordinator();
        coordinator.store_result("k", &ImageData::new(vec![1u8]));
        coordinator.invalidate("k").unwrap();
        assert_eq!(coordinator.lookup(&keyed(1, "k")), CacheLookup::Miss);
    }

    struct BrokenStore;

    impl CacheStore for BrokenStore {
        fn get(&self, _raw_key: &str, _max_age: Duration) -> Result<CacheStatus, CacheError> {
            panic!("index corrupted");
        }

        fn put(&self, _raw_key: &str, _bytes: &[u8], _written_at: SystemTime) -> Result<(), CacheError> {
            panic!("disk full");
        }

        fn remove(&self, _raw_key: &str) -> Result<(), CacheError> {
            Ok(())
        }

        fn contains(&self, _raw_key: &str) -> bool {
            false
        }
    }

    #[test]
    fn test_store_panics_are_contained() {
        let coordinator = CacheCoordinator::new(Arc::new(BrokenStore), Duration::from_secs(60));
        let task = keyed(1, "k");

        assert_eq!(coordinator.lookup(&task), CacheLookup::Miss);
        coordinator.store_result("k", &ImageData::new(vec![1u8]));
        assert_eq!(coordinator.claim(&task), InFlightClaim::Owner);
        assert!(coordinator.release(&task).is_empty());
        assert_eq!(coordinator.in_flight_count(), 0);
    }
}
