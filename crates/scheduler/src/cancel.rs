//! Cancellation token for image loading tasks
//!
//! Cancellation is cooperative. Setting the flag guarantees that a pending
//! task is never admitted and that a running task never reports success, but
//! a running executor only stops early if it checks the token at its own
//! safe points (before each read, before writing to cache).

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::ExecutionError;

/// Cancellation token for cooperative task cancellation
///
/// Cloning shares the same underlying flag. The flag only ever goes from
/// "not cancelled" to "cancelled".
///
/// # Example
///
/// ```
/// use image_loader_scheduler::{CancellationToken, ExecutionError};
///
/// let token = CancellationToken::new();
/// let worker_token = token.clone();
///
/// fn read_chunk(token: &CancellationToken) -> Result<(), ExecutionError> {
///     token.checkpoint()?;
///     // ... read from the network ...
///     Ok(())
/// }
///
/// assert!(read_chunk(&worker_token).is_ok());
/// token.cancel();
/// assert_eq!(read_chunk(&worker_token), Err(ExecutionError::Cancelled));
/// ```
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a new token in the non-cancelled state
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent, callable from any thread.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Check if cancellation has been requested on this token or any clone
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Safe-point check for executors: `Err(ExecutionError::Cancelled)` once
    /// cancellation has been requested.
    pub fn checkpoint(&self) -> Result<(), ExecutionError> {
        if self.is_cancelled() {
            Err(ExecutionError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, waking early if cancelled.
    ///
    /// Returns `true` if the full duration elapsed without cancellation.
    pub fn sleep(&self, duration: Duration) -> bool {
        const STEP: Duration = Duration::from_millis(5);

        // No representable deadline means sleep until cancelled.
        let deadline = Instant::now().checked_add(duration);
        loop {
            if self.is_cancelled() {
                return false;
            }
            let step = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return true;
                    }
                    STEP.min(deadline - now)
                }
                None => STEP,
            };
            thread::sleep(step);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_token_basic() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());

        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_cancellation_token_clone() {
        let token1 = CancellationToken::new();
        let token2 = token1.clone();

        token1.cancel();
        assert!(token2.is_cancelled());
    }

    #[test]
    fn test_cancellation_token_idempotent() {
        let token = CancellationToken::new();
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_checkpoint() {
        let token = CancellationToken::default();
        assert_eq!(token.checkpoint(), Ok(()));

        token.cancel();
        assert_eq!(token.checkpoint(), Err(ExecutionError::Cancelled));
    }

    #[test]
    fn test_sleep_completes_without_cancel() {
        let token = CancellationToken::new();
        let start = Instant::now();
        assert!(token.sleep(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_sleep_wakes_on_cancel() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            canceller.cancel();
        });

        let start = Instant::now();
        assert!(!token.sleep(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_sleep_without_deadline_wakes_on_cancel() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            canceller.cancel();
        });

        assert!(!token.sleep(Duration::MAX));
        handle.join().unwrap();
    }
}
