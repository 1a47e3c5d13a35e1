//! Where completion callbacks run.
//!
//! By default callbacks run on whichever worker thread finished the task.
//! Applications that must touch their views from one thread can ask the
//! dispatcher to hop every notification onto a designated thread instead.

use std::fmt;
use std::io;
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam::channel::{self, Sender};
use tracing::{debug, warn};

/// A unit of delivery work
pub type DeliveryJob = Box<dyn FnOnce() + Send + 'static>;

/// Something that can run jobs on a particular thread
///
/// Implement this to route callbacks onto an application's UI loop.
pub trait DeliveryContext: Send + Sync {
    /// Queue `job` to run on the context's thread. Must not block on the job.
    fn post(&self, job: DeliveryJob);
}

/// A dedicated thread that runs posted jobs one at a time, in posting order
pub struct DeliveryThread {
    sender: Option<Sender<DeliveryJob>>,
    thread: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl DeliveryThread {
    /// Default thread name
    pub const DEFAULT_NAME: &'static str = "image-loader-delivery";

    /// Spawn a delivery thread with the default name
    pub fn spawn() -> io::Result<Self> {
        Self::spawn_named(Self::DEFAULT_NAME)
    }

    /// Spawn a delivery thread with a custom name
    pub fn spawn_named(name: &str) -> io::Result<Self> {
        let (sender, receiver) = channel::unbounded::<DeliveryJob>();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                debug!("delivery thread started");
                for job in receiver {
                    job();
                }
                debug!("delivery thread stopped");
            })?;
        let thread_id = thread.thread().id();

        Ok(Self {
            sender: Some(sender),
            thread: Some(thread),
            thread_id,
        })
    }

    /// Id of the delivery thread
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }
}

impl DeliveryContext for DeliveryThread {
    fn post(&self, job: DeliveryJob) {
        let Some(sender) = &self.sender else {
            job();
            return;
        };
        if let Err(err) = sender.send(job) {
            warn!("delivery thread is gone, running callback inline");
            (err.into_inner())();
        }
    }
}

impl Drop for DeliveryThread {
    fn drop(&mut self) {
        // Closing the channel lets the thread drain what is queued and exit.
        drop(self.sender.take());
        if let Some(thread) = self.thread.take() {
            if thread::current().id() != self.thread_id {
                let _ = thread.join();
            }
        }
    }
}

impl fmt::Debug for DeliveryThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryThread")
            .field("thread_id", &self.thread_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_jobs_run_on_delivery_thread() {
        let delivery = DeliveryThread::spawn().unwrap();
        let (tx, rx) = channel::unbounded();

        for _ in 0..3 {
            let tx = tx.clone();
            delivery.post(Box::new(move || {
                tx.send(thread::current().id()).unwrap();
            }));
        }

        for _ in 0..3 {
            assert_eq!(rx.recv().unwrap(), delivery.thread_id());
        }
    }

    #[test]
    fn test_jobs_run_in_posting_order() {
        let delivery = DeliveryThread::spawn_named("ordering-test").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..50 {
            let seen = seen.clone();
            delivery.post(Box::new(move || seen.lock().unwrap().push(i)));
        }
        drop(delivery);

        assert_eq!(*seen.lock().unwrap(), (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_thread_name() {
        let delivery = DeliveryThread::spawn().unwrap();
        let (tx, rx) = channel::bounded(1);
        delivery.post(Box::new(move || {
            tx.send(thread::current().name().map(str::to_string)).unwrap();
        }));
        assert_eq!(
            rx.recv().unwrap().as_deref(),
            Some(DeliveryThread::DEFAULT_NAME)
        );
    }
}
