//! Error types for scheduling, execution and configuration.

use std::any::Any;
use std::io;

use thiserror::Error;

use crate::task::TaskId;

/// Errors surfaced by the scheduler to callers and task observers.
///
/// `Clone` so a single failure can be fanned out to every observer attached
/// to the same in-flight task.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchedulerError {
    /// Caller misuse: double insert, operation on a finished task, and so on
    #[error("invalid state for task {task}: {reason}")]
    InvalidState { task: TaskId, reason: String },

    /// Cooperative stop; not a failure
    #[error("task {0} was cancelled")]
    Cancelled(TaskId),

    /// The fetch/decode executor reported a failure
    #[error("task {task} failed: {source}")]
    Execution {
        task: TaskId,
        #[source]
        source: ExecutionError,
    },

    /// The slot-count factory produced an unusable value
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Scheduler bookkeeping is corrupt; the dispatcher halts
    #[error("scheduler invariant violated: {0}")]
    InvariantViolation(String),

    /// The dispatcher was shut down or halted and accepts no more work
    #[error("dispatcher is no longer accepting tasks")]
    Halted,
}

impl SchedulerError {
    pub(crate) fn invalid_state(task: TaskId, reason: impl Into<String>) -> Self {
        SchedulerError::InvalidState {
            task,
            reason: reason.into(),
        }
    }
}

/// Errors returned by a [`TaskExecutor`](crate::TaskExecutor).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionError {
    /// The executor observed the cancellation flag and stopped early
    #[error("stopped at a cancellation checkpoint")]
    Cancelled,

    /// Fetching or decoding failed
    #[error("{0}")]
    Failed(String),
}

impl ExecutionError {
    /// Convenience constructor for [`ExecutionError::Failed`]
    pub fn failed(message: impl Into<String>) -> Self {
        ExecutionError::Failed(message.into())
    }
}

impl From<io::Error> for ExecutionError {
    fn from(err: io::Error) -> Self {
        ExecutionError::Failed(err.to_string())
    }
}

/// Errors loading a [`SchedulerConfig`](crate::SchedulerConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid value for a configuration parameter
    #[error("invalid value for configuration key: {0}")]
    InvalidValue(String),

    /// I/O error reading or writing a configuration file
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed TOML
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Configuration could not be rendered as TOML
    #[error("serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Best-effort text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
