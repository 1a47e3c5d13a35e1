#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use image_loader_scheduler::{
    Dispatcher, ExecutionContext, ExecutionError, ImageData, SchedulerConfig, TaskRequest,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn dispatcher(slots: usize) -> Dispatcher {
    Dispatcher::new(SchedulerConfig::default().with_max_parallel_tasks(slots))
        .expect("dispatcher should start")
}

/// Releases a gated executor
pub struct Gate {
    tx: Sender<()>,
}

impl Gate {
    pub fn open(&self) {
        let _ = self.tx.send(());
    }
}

/// Records which executors started, how often, and how many overlapped
#[derive(Clone)]
pub struct Recorder {
    started_tx: Sender<String>,
    started_rx: Receiver<String>,
    runs: Arc<AtomicUsize>,
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

struct Running {
    current: Arc<AtomicUsize>,
}

impl Running {
    fn enter(current: &Arc<AtomicUsize>, peak: &AtomicUsize) -> Self {
        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self {
            current: current.clone(),
        }
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Recorder {
    pub fn new() -> Self {
        let (started_tx, started_rx) = channel::unbounded();
        Self {
            started_tx,
            started_rx,
            runs: Arc::new(AtomicUsize::new(0)),
            current: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Executor that returns `bytes` immediately
    pub fn quick(&self, label: &str, bytes: &[u8]) -> TaskRequest {
        self.sleeping(label, bytes, Duration::ZERO)
    }

    /// Executor that works for `duration` before returning `bytes`
    pub fn sleeping(&self, label: &str, bytes: &[u8], duration: Duration) -> TaskRequest {
        let recorder = self.clone();
        let label = label.to_string();
        let bytes = bytes.to_vec();
        TaskRequest::new(move |ctx: &ExecutionContext<'_>| -> Result<ImageData, ExecutionError> {
            let _running = recorder.enter(&label);
            if !duration.is_zero() && !ctx.token().sleep(duration) {
                return Err(ExecutionError::Cancelled);
            }
            Ok(ImageData::new(bytes.clone()))
        })
    }

    /// Executor that blocks until its gate opens, stopping early on cancellation
    pub fn gated(&self, label: &str, bytes: &[u8]) -> (TaskRequest, Gate) {
        self.gated_with(label, bytes, true)
    }

    /// Executor that blocks until its gate opens and never checks for cancellation
    pub fn stubborn(&self, label: &str, bytes: &[u8]) -> (TaskRequest, Gate) {
        self.gated_with(label, bytes, false)
    }

    fn gated_with(&self, label: &str, bytes: &[u8], honor_cancel: bool) -> (TaskRequest, Gate) {
        let (tx, rx) = channel::unbounded::<()>();
        let recorder = self.clone();
        let label = label.to_string();
        let bytes = bytes.to_vec();
        let request =
            TaskRequest::new(move |ctx: &ExecutionContext<'_>| -> Result<ImageData, ExecutionError> {
                let _running = recorder.enter(&label);
                loop {
                    match rx.recv_timeout(Duration::from_millis(2)) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {
                            if honor_cancel {
                                ctx.checkpoint()?;
                            }
                        }
                    }
                }
                Ok(ImageData::new(bytes.clone()))
            });
        (request, Gate { tx })
    }

    /// Executor that fails with `message`
    pub fn failing(&self, label: &str, message: &str) -> TaskRequest {
        let recorder = self.clone();
        let label = label.to_string();
        let message = message.to_string();
        TaskRequest::new(move |_ctx: &ExecutionContext<'_>| -> Result<ImageData, ExecutionError> {
            let _running = recorder.enter(&label);
            Err(ExecutionError::failed(message.clone()))
        })
    }

    /// Executor that panics
    pub fn panicking(&self, label: &str) -> TaskRequest {
        let recorder = self.clone();
        let label = label.to_string();
        TaskRequest::new(move |_ctx: &ExecutionContext<'_>| -> Result<ImageData, ExecutionError> {
            let _running = recorder.enter(&label);
            panic!("decoder crashed on {}", label);
        })
    }

    fn enter(&self, label: &str) -> Running {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let running = Running::enter(&self.current, &self.peak);
        let _ = self.started_tx.send(label.to_string());
        running
    }

    /// Wait for the next executor start
    pub fn next_start(&self) -> String {
        self.started_rx
            .recv_timeout(TIMEOUT)
            .expect("an executor should have started")
    }

    /// Check that no executor starts within `window`
    pub fn quiet_for(&self, window: Duration) -> bool {
        self.started_rx.recv_timeout(window).is_err()
    }

    /// Every start recorded so far that has not been consumed
    pub fn drain_starts(&self) -> Vec<String> {
        self.started_rx.try_iter().collect()
    }

    /// Total executor invocations
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// Most executors seen running at once
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}
