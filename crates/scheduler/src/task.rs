//! Image loading task: request descriptor plus run state.
//!
//! A [`Task`] is created when a [`TaskRequest`] is submitted and lives until
//! its submitter has observed the terminal outcome. Identity is the numeric
//! [`TaskId`]; two tasks with identical parameters are still different tasks.

use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::cancel::CancellationToken;
use crate::error::SchedulerError;
use crate::executor::{SourceKind, TaskExecutor};
use crate::target::{RenderTarget, TargetRef};

/// Unique task identifier
pub type TaskId = u64;

/// Task priority. Lower values are more urgent.
pub type Priority = i32;

/// Default priority for requests that do not set one
pub const DEFAULT_PRIORITY: Priority = 0;

/// Task lifecycle state
///
/// State transitions:
/// - Pending -> Running -> Completed | Cancelled | Failed
/// - Pending -> Cancelled (cancelled before admission)
/// - Pending -> Completed | Failed (result taken from the cache or shared
///   from an identical in-flight task, so this task never ran itself)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Queued, attached to an in-flight task, or holding a reserved slot
    Pending,

    /// The executor is running this task's work
    Running,

    /// Finished with a result delivered to the submitter
    Completed,

    /// Stopped on request; no result delivered
    Cancelled,

    /// The executor reported an error
    Failed,
}

impl TaskState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Cancelled | TaskState::Failed
        )
    }

    /// Whether moving from `self` to `next` is a legal forward transition
    pub fn can_transition_to(self, next: TaskState) -> bool {
        match self {
            TaskState::Pending => next != TaskState::Pending,
            TaskState::Running => next.is_terminal(),
            _ => false,
        }
    }
}

/// Encoded or decoded image bytes produced by an executor or read from cache
#[derive(Clone, PartialEq, Eq)]
pub struct ImageData {
    bytes: Arc<[u8]>,
}

impl ImageData {
    /// Wrap image bytes
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// Borrow the bytes
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Shared handle to the bytes
    pub fn shared_bytes(&self) -> Arc<[u8]> {
        self.bytes.clone()
    }

    /// Size in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Check whether there are no bytes
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl From<Vec<u8>> for ImageData {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl From<Arc<[u8]>> for ImageData {
    fn from(bytes: Arc<[u8]>) -> Self {
        Self { bytes }
    }
}

impl fmt::Debug for ImageData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageData")
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Where a completed task's result came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultSource {
    /// This task's own executor produced it
    Executed,
    /// A fresh cache entry short-circuited the task
    Cache,
    /// An identical in-flight task produced it
    Shared,
}

/// Terminal notification delivered exactly once per task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Finished with a usable image
    Completed {
        image: ImageData,
        source: ResultSource,
    },

    /// Cancelled before or during execution; any result was discarded
    Cancelled,

    /// Finished with an error
    Failed(SchedulerError),
}

impl TaskOutcome {
    /// The terminal [`TaskState`] this outcome corresponds to
    pub fn state(&self) -> TaskState {
        match self {
            TaskOutcome::Completed { .. } => TaskState::Completed,
            TaskOutcome::Cancelled => TaskState::Cancelled,
            TaskOutcome::Failed(_) => TaskState::Failed,
        }
    }

    /// The image, if completed
    pub fn image(&self) -> Option<&ImageData> {
        match self {
            TaskOutcome::Completed { image, .. } => Some(image),
            _ => None,
        }
    }

    /// Convert to a `Result`, mapping cancellation to [`SchedulerError::Cancelled`]
    pub fn into_result(self, task: TaskId) -> Result<ImageData, SchedulerError> {
        match self {
            TaskOutcome::Completed { image, .. } => Ok(image),
            TaskOutcome::Cancelled => Err(SchedulerError::Cancelled(task)),
            TaskOutcome::Failed(err) => Err(err),
        }
    }
}

/// Callback invoked with a task's terminal outcome
pub type CompletionCallback = Box<dyn FnOnce(&TaskOutcome) + Send + 'static>;

/// Everything a caller specifies when asking for an image
///
/// # Example
///
/// ```
/// use image_loader_scheduler::{ExecutionContext, ExecutionError, ImageData, TaskRequest};
/// use std::sync::Arc;
///
/// struct ImageView;
/// let view = Arc::new(ImageView);
///
/// let request = TaskRequest::new(|ctx: &ExecutionContext<'_>| -> Result<ImageData, ExecutionError> {
///     ctx.checkpoint()?;
///     Ok(ImageData::new(vec![0u8; 16]))
/// })
/// .with_priority(-1)
/// .with_raw_key("https://example.com/avatar.png;resize=64x64")
/// .with_target(&view)
/// .on_finish(|outcome| println!("finished: {:?}", outcome.state()));
/// ```
pub struct TaskRequest {
    pub(crate) priority: Priority,
    pub(crate) raw_key: Option<String>,
    pub(crate) target: Option<TargetRef>,
    pub(crate) executor: Arc<dyn TaskExecutor>,
    pub(crate) callbacks: Vec<CompletionCallback>,
}

impl TaskRequest {
    /// Create a request that runs `executor` when admitted
    pub fn new<E: TaskExecutor + 'static>(executor: E) -> Self {
        Self::with_executor(Arc::new(executor))
    }

    /// Create a request from a shared executor
    pub fn with_executor(executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            raw_key: None,
            target: None,
            executor,
            callbacks: Vec::new(),
        }
    }

    /// Set the priority (lower is more urgent)
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the cache key used for cache lookups and deduplication
    pub fn with_raw_key(mut self, raw_key: impl Into<String>) -> Self {
        self.raw_key = Some(raw_key.into());
        self
    }

    /// Set the destination this image will be rendered into
    pub fn with_target<T: RenderTarget + 'static>(mut self, target: &Arc<T>) -> Self {
        self.target = Some(TargetRef::new(target));
        self
    }

    /// Set the destination from an existing reference
    pub fn with_target_ref(mut self, target: TargetRef) -> Self {
        self.target = Some(target);
        self
    }

    /// Drop the destination, turning this into a cache warm-up request
    pub fn without_target(mut self) -> Self {
        self.target = None;
        self
    }

    /// Register a callback for the terminal outcome
    pub fn on_finish<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&TaskOutcome) + Send + 'static,
    {
        self.callbacks.push(Box::new(callback));
        self
    }
}

/// A submitted request and its run state
pub struct Task {
    id: TaskId,
    priority: AtomicI32,
    raw_key: Option<String>,
    target: Option<TargetRef>,
    executor: Arc<dyn TaskExecutor>,
    token: CancellationToken,
    state: Mutex<TaskState>,
    callbacks: Mutex<Vec<CompletionCallback>>,
    outcome: Mutex<Option<TaskOutcome>>,
    finished: Condvar,
    created_at: Instant,
}

impl Task {
    /// Create a pending task from a request
    pub fn new(id: TaskId, request: TaskRequest) -> Arc<Self> {
        Arc::new(Self {
            id,
            priority: AtomicI32::new(request.priority),
            raw_key: request.raw_key,
            target: request.target,
            executor: request.executor,
            token: CancellationToken::new(),
            state: Mutex::new(TaskState::Pending),
            callbacks: Mutex::new(request.callbacks),
            outcome: Mutex::new(None),
            finished: Condvar::new(),
            created_at: Instant::now(),
        })
    }

    /// Task identifier
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Current priority
    pub fn priority(&self) -> Priority {
        self.priority.load(Ordering::Acquire)
    }

    /// Cache key, if any
    pub fn raw_key(&self) -> Option<&str> {
        self.raw_key.as_deref()
    }

    /// Destination reference, if any
    pub fn target(&self) -> Option<&TargetRef> {
        self.target.as_ref()
    }

    /// Kind of source the executor reads from
    pub fn source_kind(&self) -> SourceKind {
        self.executor.source_kind()
    }

    /// Current lifecycle state
    pub fn state(&self) -> TaskState {
        *self.state.lock()
    }

    /// The task's cancellation token
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether cancellation has been requested
    pub fn is_cancel_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Request cancellation. Advisory; see [`CancellationToken`].
    pub fn request_cancel(&self) {
        self.token.cancel();
    }

    /// Whether both tasks resolve to the same live destination
    pub fn uses_same_target(&self, other: &Task) -> bool {
        match (&self.target, &other.target) {
            (Some(a), Some(b)) => a.same_destination(b),
            _ => false,
        }
    }

    /// Time since the task was created
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// The terminal outcome, if reached
    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.outcome.lock().clone()
    }

    /// Block until the task reaches a terminal outcome
    pub fn wait(&self) -> TaskOutcome {
        let mut outcome = self.outcome.lock();
        loop {
            if let Some(outcome) = outcome.as_ref() {
                return outcome.clone();
            }
            self.finished.wait(&mut outcome);
        }
    }

    /// Block until the task finishes or `timeout` elapses
    pub fn wait_timeout(&self, timeout: Duration) -> Option<TaskOutcome> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return Some(self.wait());
        };
        let mut outcome = self.outcome.lock();
        loop {
            if let Some(outcome) = outcome.as_ref() {
                return Some(outcome.clone());
            }
            if self.finished.wait_until(&mut outcome, deadline).timed_out() {
                return outcome.clone();
            }
        }
    }

    pub(crate) fn executor(&self) -> &Arc<dyn TaskExecutor> {
        &self.executor
    }

    pub(crate) fn set_priority(&self, priority: Priority) {
        self.priority.store(priority, Ordering::Release);
    }

    pub(crate) fn transition(&self, next: TaskState) -> Result<(), SchedulerError> {
        let mut state = self.state.lock();
        if !state.can_transition_to(next) {
            return Err(SchedulerError::invalid_state(
                self.id,
                format!("cannot move from {:?} to {:?}", *state, next),
            ));
        }
        *state = next;
        Ok(())
    }

    /// Record the terminal outcome and hand back the callbacks to run.
    ///
    /// A task whose cancellation was requested always ends as `Cancelled`,
    /// whatever its work produced.
    pub(crate) fn finish(
        &self,
        outcome: TaskOutcome,
    ) -> Result<(TaskOutcome, Vec<CompletionCallback>), SchedulerError> {
        let outcome = if self.is_cancel_requested() {
            TaskOutcome::Cancelled
        } else {
            outcome
        };

        self.transition(outcome.state())?;
        let callbacks = std::mem::take(&mut *self.callbacks.lock());

        *self.outcome.lock() = Some(outcome.clone());
        self.finished.notify_all();

        Ok((outcome, callbacks))
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("priority", &self.priority())
            .field("raw_key", &self.raw_key)
            .field("state", &self.state())
            .field("cancel_requested", &self.is_cancel_requested())
            .finish()
    }
}
