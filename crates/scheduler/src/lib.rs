//! Image Loader Scheduler Library
//!
//! Priority scheduling, cache coordination and bounded parallel execution
//! for image loading requests.
//!
//! Requests are queued by priority (lower value first, FIFO within a
//! priority) and admitted to a bounded number of execution slots. Before a
//! request runs, the cache is consulted and identical in-flight requests are
//! shared rather than repeated. A request that names a rendering destination
//! replaces any older request for the same destination.
//!
//! # Example
//!
//! ```
//! use image_loader_scheduler::{
//!     Dispatcher, ExecutionContext, ExecutionError, ImageData, SchedulerConfig, TaskOutcome,
//!     TaskRequest,
//! };
//! use std::sync::Arc;
//!
//! struct Thumbnail;
//! let view = Arc::new(Thumbnail);
//!
//! let dispatcher = Dispatcher::new(SchedulerConfig::default())?;
//!
//! let handle = dispatcher.submit(
//!     TaskRequest::new(|ctx: &ExecutionContext<'_>| -> Result<ImageData, ExecutionError> {
//!         // Fetch and decode here, checking for cancellation between reads
//!         ctx.checkpoint()?;
//!         Ok(ImageData::new(vec![0u8; 64]))
//!     })
//!     .with_priority(0)
//!     .with_raw_key("https://example.com/photo.jpg;thumb=128")
//!     .with_target(&view)
//!     .on_finish(|outcome| {
//!         if let TaskOutcome::Completed { image, .. } = outcome {
//!             println!("got {} bytes", image.len());
//!         }
//!     }),
//! )?;
//!
//! assert!(matches!(handle.wait(), TaskOutcome::Completed { .. }));
//! # Ok::<(), image_loader_scheduler::SchedulerError>(())
//! ```

mod cancel;
mod config;
mod coordinator;
mod delivery;
mod dispatcher;
mod error;
mod executor;
mod priority;
mod target;
mod task;

// Re-export public API
pub use cancel::CancellationToken;
pub use config::{BoxError, MaxSlotsFactory, SchedulerConfig};
pub use coordinator::{CacheCoordinator, CacheLookup, InFlightClaim};
pub use delivery::{DeliveryContext, DeliveryJob, DeliveryThread};
pub use dispatcher::{Dispatcher, DispatcherBuilder, SchedulerStats, TaskHandle};
pub use error::{ConfigError, ExecutionError, SchedulerError};
pub use executor::{EmbeddedSource, ExecutionContext, FileSource, SourceKind, TaskExecutor};
pub use priority::PriorityQueue;
pub use target::{RenderTarget, TargetRef};
pub use task::{
    CompletionCallback, ImageData, Priority, ResultSource, Task, TaskId, TaskOutcome,
    TaskRequest, TaskState, DEFAULT_PRIORITY,
};

pub use image_loader_cache as cache;
