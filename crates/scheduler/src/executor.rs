//! The fetch/decode seam.
//!
//! The scheduler does not know how an image is fetched or decoded. Each
//! request carries a [`TaskExecutor`] with a single `run` operation; the
//! dispatcher calls it on a worker thread once the task holds a slot and the
//! cache could not answer. A few concrete sources are provided for local
//! files and in-memory resources; network sources live with the caller.

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use crate::cancel::CancellationToken;
use crate::error::ExecutionError;
use crate::task::{ImageData, Priority, TaskId};

/// Where an executor reads its bytes from. Used for logging only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// Remote URL
    Url,
    /// File on local storage
    File,
    /// Resource compiled into or bundled with the application
    Embedded,
    /// Caller-provided byte stream
    Stream,
    /// Anything else
    Custom,
}

/// Inputs available to an executor while it runs
pub struct ExecutionContext<'a> {
    pub(crate) task_id: TaskId,
    pub(crate) priority: Priority,
    pub(crate) raw_key: Option<&'a str>,
    pub(crate) token: &'a CancellationToken,
    pub(crate) stale: Option<ImageData>,
}

impl<'a> ExecutionContext<'a> {
    /// Identifier of the task being run
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Priority the task was admitted with
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// The task's cache key, if any
    pub fn raw_key(&self) -> Option<&'a str> {
        self.raw_key
    }

    /// The task's cancellation token
    pub fn token(&self) -> &'a CancellationToken {
        self.token
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Shorthand for [`CancellationToken::checkpoint`]
    pub fn checkpoint(&self) -> Result<(), ExecutionError> {
        self.token.checkpoint()
    }

    /// Expired cache entry for this key, usable for revalidation
    pub fn stale(&self) -> Option<&ImageData> {
        self.stale.as_ref()
    }
}

/// Fetch-and-decode work for one task
///
/// Implementations should call [`ExecutionContext::checkpoint`] at their
/// safe points so a cancelled task releases its slot early.
pub trait TaskExecutor: Send + Sync {
    /// Produce the image bytes
    fn run(&self, ctx: &ExecutionContext<'_>) -> Result<ImageData, ExecutionError>;

    /// Kind of source, for diagnostics
    fn source_kind(&self) -> SourceKind {
        SourceKind::Custom
    }
}

impl<F> TaskExecutor for F
where
    F: Fn(&ExecutionContext<'_>) -> Result<ImageData, ExecutionError> + Send + Sync,
{
    fn run(&self, ctx: &ExecutionContext<'_>) -> Result<ImageData, ExecutionError> {
        self(ctx)
    }
}

/// Reads an image file from local storage in chunks, checking for
/// cancellation before every chunk.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    chunk_size: usize,
}

impl FileSource {
    const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            chunk_size: Self::DEFAULT_CHUNK_SIZE,
        }
    }

    /// Override the read chunk size (minimum 1 byte)
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }
}

impl TaskExecutor for FileSource {
    fn run(&self, ctx: &ExecutionContext<'_>) -> Result<ImageData, ExecutionError> {
        ctx.checkpoint()?;
        let mut file = File::open(&self.path).map_err(|e| {
            ExecutionError::failed(format!("failed to open {}: {}", self.path.display(), e))
        })?;

        let mut bytes = Vec::new();
        let mut chunk = vec![0u8; self.chunk_size];
        loop {
            ctx.checkpoint()?;
            let read = file.read(&mut chunk)?;
            if read == 0 {
                break;
            }
            bytes.extend_from_slice(&chunk[..read]);
        }

        if bytes.is_empty() {
            return Err(ExecutionError::failed(format!(
                "{} is empty",
                self.path.display()
            )));
        }
        Ok(ImageData::new(bytes))
    }

    fn source_kind(&self) -> SourceKind {
        SourceKind::File
    }
}

/// Serves bytes that are already in memory (bundled resources, test data)
#[derive(Debug, Clone)]
pub struct EmbeddedSource {
    bytes: Arc<[u8]>,
}

impl EmbeddedSource {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }
}

impl TaskExecutor for EmbeddedSource {
    fn run(&self, ctx: &ExecutionContext<'_>) -> Result<ImageData, ExecutionError> {
        ctx.checkpoint()?;
        Ok(ImageData::from(self.bytes.clone()))
    }

    fn source_kind(&self) -> SourceKind {
        SourceKind::Embedded
    }
}
