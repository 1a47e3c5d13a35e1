//! Dispatcher: admission, slot accounting and result delivery.
//!
//! Submitted tasks wait in the [`PriorityQueue`] until a slot is free.
//! Admitted tasks run on a pool of long-lived named worker threads that grows
//! on demand, so the scheduler is never blocked on a slow fetch. Every
//! admitted task releases its slot exactly once, however its work ends, and
//! every submitted task receives exactly one terminal notification.
//!
//! Lock order is dispatch state, then queue. The in-flight registry lock is
//! never held while taking either of them.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use image_loader_cache::{CacheConfig, CacheError, CacheStore};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::coordinator::{CacheCoordinator, CacheLookup, InFlightClaim};
use crate::delivery::{DeliveryContext, DeliveryThread};
use crate::error::{panic_message, ExecutionError, SchedulerError};
use crate::executor::ExecutionContext;
use crate::priority::PriorityQueue;
use crate::task::{
    CompletionCallback, ImageData, Priority, ResultSource, Task, TaskId, TaskOutcome,
    TaskRequest, TaskState,
};

/// Dispatcher statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Total tasks submitted
    pub tasks_submitted: u64,

    /// Tasks that reached the executor
    pub tasks_admitted: u64,

    /// Tasks completed with a result (executed, cached or shared)
    pub tasks_completed: u64,

    /// Tasks cancelled
    pub tasks_cancelled: u64,

    /// Tasks failed
    pub tasks_failed: u64,

    /// Tasks answered from the cache
    pub cache_hits: u64,

    /// Tasks attached to an identical in-flight task
    pub deduplicated: u64,

    /// Slots currently occupied
    pub active: usize,

    /// Highest slot occupancy seen
    pub peak_active: usize,

    /// Current queue size
    pub queue_size: usize,

    /// Worker threads started so far
    pub worker_threads: usize,

    /// Worker threads waiting for a task
    pub idle_workers: usize,
}

impl SchedulerStats {
    /// Number of submitted tasks without a terminal outcome yet
    pub fn unfinished(&self) -> u64 {
        self.tasks_submitted
            .saturating_sub(self.tasks_completed + self.tasks_cancelled + self.tasks_failed)
    }
}

/// Builder for a [`Dispatcher`]
pub struct DispatcherBuilder {
    config: SchedulerConfig,
    store: Option<Arc<dyn CacheStore>>,
    delivery: Option<Arc<dyn DeliveryContext>>,
}

impl DispatcherBuilder {
    /// Cache store consulted before running tasks. Defaults to an in-memory
    /// store sized by [`CacheConfig::default`].
    pub fn cache_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Deliver callbacks through `context`. Takes precedence over the
    /// dedicated thread `deliver_on_designated_thread` would start.
    pub fn delivery_context(mut self, context: Arc<dyn DeliveryContext>) -> Self {
        self.delivery = Some(context);
        self
    }

    pub fn build(self) -> Result<Dispatcher, SchedulerError> {
        let store: Arc<dyn CacheStore> = match self.store {
            Some(store) => store,
            None => Arc::new(CacheConfig::default().memory_cache()),
        };

        let delivery = match self.delivery {
            Some(context) => Some(context),
            None if self.config.deliver_on_designated_thread => {
                let thread = DeliveryThread::spawn().map_err(|e| {
                    SchedulerError::Configuration(format!(
                        "failed to start delivery thread: {}",
                        e
                    ))
                })?;
                Some(Arc::new(thread) as Arc<dyn DeliveryContext>)
            }
            None => None,
        };

        let (jobs, job_receiver) = channel::unbounded();
        let coordinator = CacheCoordinator::new(store, self.config.disk_cache_duration)
            .with_cache_logging(self.config.logs_memory_cache());

        info!(
            max_parallel_tasks = self.config.max_parallel_tasks,
            dynamic_slots = self.config.max_parallel_tasks_factory.is_some(),
            designated_delivery = delivery.is_some(),
            "image dispatcher started"
        );

        let inner = Arc::new(Inner {
            config: self.config,
            queue: PriorityQueue::new(),
            coordinator,
            state: Mutex::new(DispatchState::default()),
            idle: Condvar::new(),
            delivery,
            jobs,
            job_receiver,
            next_id: AtomicU64::new(1),
        });
        inner.pump();

        Ok(Dispatcher { inner })
    }
}

/// Image task dispatcher
///
/// Cheap to clone; clones share the same queue, slots and cache. Construct
/// one per image pipeline and pass it to everything that submits work.
///
/// # Example
///
/// ```
/// use image_loader_scheduler::{
///     Dispatcher, ExecutionContext, ExecutionError, ImageData, SchedulerConfig, TaskRequest,
/// };
/// use std::time::Duration;
///
/// let dispatcher = Dispatcher::new(SchedulerConfig::default().with_max_parallel_tasks(2))?;
///
/// let handle = dispatcher.submit(
///     TaskRequest::new(|ctx: &ExecutionContext<'_>| -> Result<ImageData, ExecutionError> {
///         ctx.checkpoint()?;
///         Ok(ImageData::new(vec![0x89, b'P', b'N', b'G']))
///     })
///     .with_raw_key("icons/logo.png"),
/// )?;
///
/// let image = handle.wait_result()?;
/// assert_eq!(image.len(), 4);
/// assert!(dispatcher.wait_idle(Duration::from_secs(1)));
/// # Ok::<(), image_loader_scheduler::SchedulerError>(())
/// ```
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    config: SchedulerConfig,
    queue: PriorityQueue,
    coordinator: CacheCoordinator,
    state: Mutex<DispatchState>,
    idle: Condvar,
    delivery: Option<Arc<dyn DeliveryContext>>,
    jobs: Sender<Job>,
    job_receiver: Receiver<Job>,
    next_id: AtomicU64,
}

#[derive(Default)]
struct DispatchState {
    /// Occupied slots (Reserved or Executing)
    active: usize,

    /// Tasks taken off the queue whose cache check is still running
    admitting: usize,

    /// Tasks holding a slot
    slots: HashMap<TaskId, Arc<Task>>,

    /// An invariant broke; nothing more is admitted
    halted: bool,

    /// Shut down by the owner
    shut_down: bool,

    /// Worker threads started, and how many of them are waiting for a job
    workers: usize,
    idle_workers: usize,

    stats: SchedulerStats,
}

impl DispatchState {
    fn is_closed(&self) -> bool {
        self.halted || self.shut_down
    }
}

/// An admitted task on its way to a worker
struct Job {
    inner: Arc<Inner>,
    task: Arc<Task>,
    stale: Option<ImageData>,
}

/// Runs jobs until every dispatcher handle is gone and the channel closes
fn worker_loop(jobs: Receiver<Job>) {
    for Job { inner, task, stale } in jobs.iter() {
        inner.run_task(task, stale);
        inner.state.lock().idle_workers += 1;
    }
}

/// A terminal outcome waiting to be handed to its callbacks
struct Notification {
    task: TaskId,
    outcome: TaskOutcome,
    callbacks: Vec<CompletionCallback>,
}

/// What a worker's pass over an admitted task produced
enum Work {
    /// The task attached to an in-flight owner and will be settled by it
    Attached(TaskId),

    /// The task (and any observers) are ready to be settled
    Finished {
        outcome: TaskOutcome,
        observers: Vec<(Arc<Task>, TaskOutcome)>,
    },
}

impl Work {
    fn done(outcome: TaskOutcome) -> Self {
        Work::Finished {
            outcome,
            observers: Vec::new(),
        }
    }
}

/// Releases a task's slot when dropped, unless released explicitly first
struct SlotGuard<'a> {
    inner: &'a Inner,
    task: TaskId,
    released: bool,
}

impl<'a> SlotGuard<'a> {
    fn new(inner: &'a Inner, task: TaskId) -> Self {
        Self {
            inner,
            task,
            released: false,
        }
    }

    fn release(mut self) {
        self.released = true;
        let _ = self.inner.release_slot(self.task);
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.inner.release_slot(self.task);
        }
    }
}

impl Dispatcher {
    /// Create a dispatcher with the default in-memory cache store
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        Self::builder(config).build()
    }

    /// Start building a dispatcher
    pub fn builder(config: SchedulerConfig) -> DispatcherBuilder {
        DispatcherBuilder {
            config,
            store: None,
            delivery: None,
        }
    }

    /// The configuration this dispatcher was built with
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Submit a request
    ///
    /// Never waits for the work itself. A request naming a destination
    /// cancels older requests for that destination. A request whose raw key
    /// is already executing shares that execution's result, and one whose
    /// raw key is fresh in the cache completes immediately without a slot.
    pub fn submit(&self, request: TaskRequest) -> Result<TaskHandle, SchedulerError> {
        self.inner.submit(request)
    }

    /// Warm the cache for a request without tying it to a destination
    pub fn preload(&self, request: TaskRequest) -> Result<TaskHandle, SchedulerError> {
        self.inner.submit(request.without_target())
    }

    /// Drop the cached entry for `raw_key` so the next request fetches again
    pub fn invalidate(&self, raw_key: &str) -> Result<(), CacheError> {
        self.inner.coordinator.invalidate(raw_key)?;
        if self.inner.config.logs_memory_cache() {
            debug!(raw_key, "invalidated cache entry");
        }
        Ok(())
    }

    /// Change the priority of a pending (queued) task
    ///
    /// Fails with [`SchedulerError::InvalidState`] once the task has left
    /// the queue.
    pub fn reprioritize(&self, id: TaskId, priority: Priority) -> Result<(), SchedulerError> {
        if self.inner.queue.update_priority(id, priority) {
            Ok(())
        } else {
            Err(SchedulerError::invalid_state(id, "task is not pending in the queue"))
        }
    }

    /// Request cancellation of a task by id
    ///
    /// Returns `true` if the task was found queued, attached or holding a
    /// slot.
    pub fn cancel(&self, id: TaskId) -> bool {
        self.inner.cancel_by_id(id)
    }

    /// Get dispatcher statistics
    pub fn stats(&self) -> SchedulerStats {
        let state = self.inner.state.lock();
        let mut stats = state.stats.clone();
        stats.active = state.active;
        stats.queue_size = self.inner.queue.len();
        stats.worker_threads = state.workers;
        stats.idle_workers = state.idle_workers;
        stats
    }

    /// Number of tasks waiting in the queue
    pub fn pending_count(&self) -> usize {
        self.inner.queue.len()
    }

    /// Number of occupied slots
    pub fn active_count(&self) -> usize {
        self.inner.state.lock().active
    }

    /// Number of raw keys currently executing
    pub fn in_flight_count(&self) -> usize {
        self.inner.coordinator.in_flight_count()
    }

    /// Whether the dispatcher has stopped accepting work
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().is_closed()
    }

    /// Block until no slot is occupied and the queue is empty
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        const POLL: Duration = Duration::from_millis(10);

        // A timeout too large to add to now means no deadline.
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.inner.state.lock();
        loop {
            if state.active == 0 && state.admitting == 0 && self.inner.queue.is_empty() {
                return true;
            }
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    (deadline - now).min(POLL)
                }
                None => POLL,
            };
            self.inner.idle.wait_for(&mut state, wait);
        }
    }

    /// Stop accepting work, cancel everything queued and ask running tasks
    /// to stop
    pub fn shutdown(&self) {
        info!("image dispatcher shutting down");
        self.inner.close(false);
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Inner {
    fn submit(self: &Arc<Self>, request: TaskRequest) -> Result<TaskHandle, SchedulerError> {
        {
            let mut state = self.state.lock();
            if state.is_closed() {
                return Err(SchedulerError::Halted);
            }
            state.stats.tasks_submitted += 1;
        }

        let task = Task::new(self.next_id.fetch_add(1, Ordering::Relaxed), request);
        let handle = TaskHandle {
            task: task.clone(),
            dispatcher: Arc::downgrade(self),
        };
        if self.config.verbose_logging {
            debug!(
                task = task.id(),
                priority = task.priority(),
                raw_key = task.raw_key(),
                source = ?task.source_kind(),
                "task submitted"
            );
        }

        let mut notifications = self.replace_destination(&task);

        match self.coordinator.lookup(&task) {
            CacheLookup::InFlight(owner) => {
                self.state.lock().stats.deduplicated += 1;
                if self.config.verbose_logging {
                    debug!(task = task.id(), owner, "attached to in-flight task");
                }
                self.deliver_all(notifications);
                return Ok(handle);
            }
            CacheLookup::Fresh(image) => {
                self.state.lock().stats.cache_hits += 1;
                notifications.extend(self.settle(
                    &task,
                    TaskOutcome::Completed {
                        image,
                        source: ResultSource::Cache,
                    },
                ));
                self.deliver_all(notifications);
                return Ok(handle);
            }
            CacheLookup::Stale(_) | CacheLookup::Miss => {}
        }

        if let Some(raw_key) = task.raw_key() {
            if let Some(pending) = self.queue.find_by_raw_key(raw_key) {
                if task.priority() < pending.priority() {
                    self.queue.update_priority(pending.id(), task.priority());
                    if self.config.verbose_logging {
                        debug!(
                            task = pending.id(),
                            priority = task.priority(),
                            "promoted pending duplicate"
                        );
                    }
                }
            }
        }

        self.queue.insert(task.clone(), task.priority())?;

        // A concurrent shutdown may have drained the queue before the insert.
        if self.state.lock().is_closed() && self.queue.remove(&task) {
            task.request_cancel();
            notifications.extend(self.settle(&task, TaskOutcome::Cancelled));
            self.deliver_all(notifications);
            return Err(SchedulerError::Halted);
        }

        self.deliver_all(notifications);
        self.pump();
        Ok(handle)
    }

    /// Cancel every other task aimed at the new task's destination
    fn replace_destination(&self, task: &Arc<Task>) -> Vec<Notification> {
        if task.target().is_none() {
            return Vec::new();
        }

        let mut replaced = self.queue.cancel_all_sharing_target(task);
        replaced.extend(self.coordinator.cancel_observers_sharing_target(task));

        let running: Vec<Arc<Task>> = {
            let state = self.state.lock();
            state
                .slots
                .values()
                .filter(|running| running.uses_same_target(task))
                .cloned()
                .collect()
        };
        for running in &running {
            running.request_cancel();
        }

        if self.config.logs_cancellation() {
            for old in replaced.iter().chain(running.iter()) {
                debug!(task = old.id(), replaced_by = task.id(), "cancelled for reused destination");
            }
        }

        replaced
            .iter()
            .filter_map(|old| self.settle(old, TaskOutcome::Cancelled))
            .collect()
    }

    /// Admit queued tasks while slots are free
    ///
    /// Every task taken off the queue is checked against the cache and the
    /// in-flight registry before it gets a slot. While that check runs the
    /// task holds a provisional admission, which counts against the bound so
    /// concurrent pumps cannot overshoot it.
    fn pump(self: &Arc<Self>) {
        let max_slots = self.config.effective_max_slots();
        loop {
            let task = {
                let mut state = self.state.lock();
                if state.is_closed() || state.active + state.admitting >= max_slots {
                    break;
                }
                let Some(task) = self.queue.extract_min() else {
                    break;
                };
                state.admitting += 1;
                task
            };
            self.admit(task);
        }
        self.idle.notify_all();
    }

    /// Decide what happens to a task taken off the queue
    fn admit(self: &Arc<Self>, task: Arc<Task>) {
        if task.is_cancel_requested() {
            if self.config.logs_cancellation() {
                debug!(task = task.id(), "discarded cancelled task at admission");
            }
            return self.settle_unadmitted(&task, TaskOutcome::Cancelled);
        }

        let stale = match self.coordinator.lookup(&task) {
            CacheLookup::Fresh(image) => {
                self.state.lock().stats.cache_hits += 1;
                return self.settle_unadmitted(
                    &task,
                    TaskOutcome::Completed {
                        image,
                        source: ResultSource::Cache,
                    },
                );
            }
            CacheLookup::InFlight(owner) => {
                if self.config.verbose_logging {
                    debug!(task = task.id(), owner, "attached to in-flight task");
                }
                let mut state = self.state.lock();
                state.stats.deduplicated += 1;
                state.admitting -= 1;
                return;
            }
            CacheLookup::Stale(image) => Some(image),
            CacheLookup::Miss => None,
        };

        let reserved = {
            let mut state = self.state.lock();
            if state.is_closed() {
                false
            } else {
                state.admitting -= 1;
                state.active += 1;
                state.stats.peak_active = state.stats.peak_active.max(state.active);
                state.slots.insert(task.id(), task.clone());
                true
            }
        };
        if reserved {
            self.dispatch(task, stale);
        } else {
            task.request_cancel();
            self.settle_unadmitted(&task, TaskOutcome::Cancelled);
        }
    }

    /// Settle a task that left the queue without taking a slot
    fn settle_unadmitted(&self, task: &Task, outcome: TaskOutcome) {
        let notification = self.settle(task, outcome);
        self.state.lock().admitting -= 1;
        self.deliver_all(notification);
    }

    /// Hand a task holding a slot to the worker pool, growing the pool when
    /// no worker is idle
    fn dispatch(self: &Arc<Self>, task: Arc<Task>, stale: Option<ImageData>) {
        let new_worker = {
            let mut state = self.state.lock();
            if state.idle_workers > 0 {
                state.idle_workers -= 1;
                None
            } else {
                state.workers += 1;
                Some(state.workers)
            }
        };

        if let Some(index) = new_worker {
            if let Err(err) = self.spawn_worker(index) {
                error!(task = task.id(), error = %err, "failed to spawn worker thread");
                let remaining = {
                    let mut state = self.state.lock();
                    state.workers -= 1;
                    state.workers
                };
                if remaining == 0 {
                    return self.fail_admitted(&task, format!("could not start worker: {}", err));
                }
            }
        }

        let job = Job {
            inner: Arc::clone(self),
            task,
            stale,
        };
        if let Err(err) = self.jobs.send(job) {
            let job = err.into_inner();
            self.fail_admitted(&job.task, "worker pool is gone".to_string());
        }
    }

    fn spawn_worker(&self, index: usize) -> io::Result<()> {
        let jobs = self.job_receiver.clone();
        thread::Builder::new()
            .name(format!("image-loader-worker-{}", index))
            .spawn(move || worker_loop(jobs))?;
        debug!(worker = index, "spawned image worker");
        Ok(())
    }

    /// Fail a task that holds a slot but never reached a worker
    fn fail_admitted(&self, task: &Task, message: String) {
        let notification = self.settle(
            task,
            TaskOutcome::Failed(SchedulerError::Execution {
                task: task.id(),
                source: ExecutionError::failed(message),
            }),
        );
        let _ = self.release_slot(task.id());
        self.deliver_all(notification);
    }

    /// Worker body for one admitted task
    fn run_task(self: &Arc<Self>, task: Arc<Task>, stale: Option<ImageData>) {
        let slot = SlotGuard::new(self, task.id());
        let started = Instant::now();

        let work = panic::catch_unwind(AssertUnwindSafe(|| self.work(&task, stale)))
            .unwrap_or_else(|payload| self.recover(&task, panic_message(payload.as_ref())));

        let notifications = match work {
            Work::Attached(owner) => {
                self.state.lock().stats.deduplicated += 1;
                if self.config.verbose_logging {
                    debug!(task = task.id(), owner, "attached to in-flight task");
                }
                Vec::new()
            }
            Work::Finished { outcome, observers } => {
                let mut notifications: Vec<Notification> =
                    self.settle(&task, outcome).into_iter().collect();
                for (observer, outcome) in observers {
                    notifications.extend(self.settle(&observer, outcome));
                }
                notifications
            }
        };

        if self.config.logs_performance() {
            debug!(
                task = task.id(),
                state = ?task.state(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "task left its slot"
            );
        }

        slot.release();
        self.pump();
        self.deliver_all(notifications);
    }

    /// Fail a task whose worker pass panicked outside the executor, together
    /// with everything attached to it
    fn recover(&self, task: &Task, message: String) -> Work {
        error!(task = task.id(), panic = %message, "image worker panicked");
        let error = SchedulerError::Execution {
            task: task.id(),
            source: ExecutionError::failed(format!("worker panicked: {}", message)),
        };
        let observers = self
            .coordinator
            .release(task)
            .into_iter()
            .map(|observer| (observer, TaskOutcome::Failed(error.clone())))
            .collect();
        Work::Finished {
            outcome: TaskOutcome::Failed(error),
            observers,
        }
    }

    fn work(&self, task: &Arc<Task>, stale: Option<ImageData>) -> Work {
        if task.is_cancel_requested() {
            return Work::done(TaskOutcome::Cancelled);
        }
        if let InFlightClaim::Attached(owner) = self.coordinator.claim(task) {
            return Work::Attached(owner);
        }

        let result = self.execute(task, stale);

        if let (Ok(image), Some(raw_key)) = (&result, task.raw_key()) {
            self.coordinator.store_result(raw_key, image);
        }
        let observers = self.coordinator.release(task);

        self.resolve(task, result, observers)
    }

    fn execute(&self, task: &Arc<Task>, stale: Option<ImageData>) -> Result<ImageData, ExecutionError> {
        let delay = self.config.delay_before_start;
        if !delay.is_zero() && !task.token().sleep(delay) {
            return Err(ExecutionError::Cancelled);
        }

        if let Err(err) = task.transition(TaskState::Running) {
            warn!(task = task.id(), error = %err, "admitted task could not start");
            return Err(ExecutionError::failed(err.to_string()));
        }
        self.state.lock().stats.tasks_admitted += 1;

        let ctx = ExecutionContext {
            task_id: task.id(),
            priority: task.priority(),
            raw_key: task.raw_key(),
            token: task.token(),
            stale,
        };

        match panic::catch_unwind(AssertUnwindSafe(|| task.executor().run(&ctx))) {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(task = task.id(), panic = %message, "executor panicked");
                Err(ExecutionError::failed(format!("executor panicked: {}", message)))
            }
        }
    }

    /// Decide the owner's outcome and fan it out to observers
    fn resolve(
        &self,
        task: &Arc<Task>,
        result: Result<ImageData, ExecutionError>,
        observers: Vec<Arc<Task>>,
    ) -> Work {
        match result {
            Ok(image) => {
                let shared = observers
                    .into_iter()
                    .map(|observer| {
                        let outcome = TaskOutcome::Completed {
                            image: image.clone(),
                            source: ResultSource::Shared,
                        };
                        (observer, outcome)
                    })
                    .collect();
                Work::Finished {
                    outcome: TaskOutcome::Completed {
                        image,
                        source: ResultSource::Executed,
                    },
                    observers: shared,
                }
            }
            Err(ExecutionError::Cancelled) => {
                if !observers.is_empty() && self.config.logs_cancellation() {
                    debug!(
                        task = task.id(),
                        observers = observers.len(),
                        "owner cancelled, re-queueing observers"
                    );
                }
                Work::Finished {
                    outcome: TaskOutcome::Cancelled,
                    observers: self.requeue(observers),
                }
            }
            Err(source) => {
                warn!(task = task.id(), raw_key = task.raw_key(), error = %source, "image task failed");
                let error = SchedulerError::Execution {
                    task: task.id(),
                    source,
                };
                let failed = observers
                    .into_iter()
                    .map(|observer| (observer, TaskOutcome::Failed(error.clone())))
                    .collect();
                Work::Finished {
                    outcome: TaskOutcome::Failed(error),
                    observers: failed,
                }
            }
        }
    }

    /// Put observers of a cancelled owner back in the queue as independent
    /// runs. Returns those that must be settled instead.
    fn requeue(&self, observers: Vec<Arc<Task>>) -> Vec<(Arc<Task>, TaskOutcome)> {
        let closed = self.state.lock().is_closed();
        let mut unqueued = Vec::new();
        for observer in observers {
            if closed || observer.is_cancel_requested() {
                unqueued.push((observer, TaskOutcome::Cancelled));
                continue;
            }
            if let Err(err) = self.queue.insert(observer.clone(), observer.priority()) {
                warn!(task = observer.id(), error = %err, "could not re-queue observer");
                unqueued.push((observer, TaskOutcome::Failed(err)));
            }
        }
        unqueued
    }

    /// Record a terminal outcome and collect the callbacks to run
    fn settle(&self, task: &Task, outcome: TaskOutcome) -> Option<Notification> {
        match task.finish(outcome) {
            Ok((outcome, callbacks)) => {
                {
                    let mut state = self.state.lock();
                    match outcome.state() {
                        TaskState::Completed => state.stats.tasks_completed += 1,
                        TaskState::Cancelled => state.stats.tasks_cancelled += 1,
                        _ => state.stats.tasks_failed += 1,
                    }
                }
                if outcome == TaskOutcome::Cancelled && self.config.logs_cancellation() {
                    debug!(task = task.id(), "task cancelled");
                }
                Some(Notification {
                    task: task.id(),
                    outcome,
                    callbacks,
                })
            }
            Err(err) => {
                debug!(task = task.id(), error = %err, "task already finished");
                None
            }
        }
    }

    /// Run callbacks, hopping to the delivery context if one is configured
    fn deliver_all(&self, notifications: impl IntoIterator<Item = Notification>) {
        for notification in notifications {
            if notification.callbacks.is_empty() {
                continue;
            }
            let Notification {
                task,
                outcome,
                callbacks,
            } = notification;

            let job = move || {
                for callback in callbacks {
                    if panic::catch_unwind(AssertUnwindSafe(|| callback(&outcome))).is_err() {
                        error!(task, "completion callback panicked");
                    }
                }
            };
            match &self.delivery {
                Some(context) => context.post(Box::new(job)),
                None => job(),
            }
        }
    }

    fn release_slot(&self, id: TaskId) -> Result<(), SchedulerError> {
        let mut state = self.state.lock();
        if state.active == 0 || state.slots.remove(&id).is_none() {
            let err = SchedulerError::InvariantViolation(format!(
                "slot released for task {} which holds none (active = {})",
                id, state.active
            ));
            drop(state);
            error!(error = %err, "slot accounting corrupted");
            self.close(true);
            return Err(err);
        }
        state.active -= 1;
        drop(state);

        self.idle.notify_all();
        Ok(())
    }

    fn cancel_by_id(&self, id: TaskId) -> bool {
        if let Some(task) = self.queue.remove_by_id(id) {
            task.request_cancel();
            let notification = self.settle(&task, TaskOutcome::Cancelled);
            self.deliver_all(notification);
            self.idle.notify_all();
            return true;
        }

        let running = self.state.lock().slots.get(&id).cloned();
        if let Some(task) = running {
            task.request_cancel();
            return true;
        }

        if let Some(task) = self.coordinator.take_observer(id) {
            task.request_cancel();
            let notification = self.settle(&task, TaskOutcome::Cancelled);
            self.deliver_all(notification);
            return true;
        }
        false
    }

    fn cancel_task(&self, task: &Arc<Task>) {
        task.request_cancel();
        if self.queue.remove(task) || self.coordinator.detach(task) {
            let notification = self.settle(task, TaskOutcome::Cancelled);
            self.deliver_all(notification);
            self.idle.notify_all();
        }
    }

    /// Stop admitting work. `halted` marks an invariant failure rather than
    /// an orderly shutdown.
    fn close(&self, halted: bool) {
        let running: Vec<Arc<Task>> = {
            let mut state = self.state.lock();
            if halted {
                state.halted = true;
            } else {
                state.shut_down = true;
            }
            state.slots.values().cloned().collect()
        };
        for task in &running {
            task.request_cancel();
        }

        for task in self.queue.drain() {
            task.request_cancel();
            let notification = self.settle(&task, TaskOutcome::Cancelled);
            self.deliver_all(notification);
        }
        self.idle.notify_all();
    }
}

/// Caller's view of a submitted task
///
/// Holding a handle does not keep the dispatcher alive.
#[derive(Clone)]
pub struct TaskHandle {
    task: Arc<Task>,
    dispatcher: Weak<Inner>,
}

impl TaskHandle {
    /// Task identifier
    pub fn id(&self) -> TaskId {
        self.task.id()
    }

    /// Current priority
    pub fn priority(&self) -> Priority {
        self.task.priority()
    }

    /// Current lifecycle state
    pub fn state(&self) -> TaskState {
        self.task.state()
    }

    /// Whether cancellation has been requested
    pub fn is_cancel_requested(&self) -> bool {
        self.task.is_cancel_requested()
    }

    /// Request cancellation
    ///
    /// A queued or attached task is cancelled immediately. A task holding a
    /// slot stops at its next checkpoint and reports `Cancelled` either way.
    pub fn cancel(&self) {
        match self.dispatcher.upgrade() {
            Some(inner) => inner.cancel_task(&self.task),
            None => self.task.request_cancel(),
        }
    }

    /// The terminal outcome, if reached
    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.task.outcome()
    }

    /// Block until the task finishes
    pub fn wait(&self) -> TaskOutcome {
        self.task.wait()
    }

    /// Block until the task finishes or `timeout` elapses
    pub fn wait_timeout(&self, timeout: Duration) -> Option<TaskOutcome> {
        self.task.wait_timeout(timeout)
    }

    /// Block until the task finishes, as a `Result`
    pub fn wait_result(&self) -> Result<ImageData, SchedulerError> {
        self.task.wait().into_result(self.task.id())
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("task", &self.task)
            .finish()
    }
}
