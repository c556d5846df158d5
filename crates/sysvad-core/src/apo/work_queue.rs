//! Real-time work queue
//!
//! A bounded crossbeam channel feeding one named worker thread. Posting
//! never blocks: a full queue is reported to the caller. Each item runs
//! exactly once; a panicking item is logged and does not take the worker
//! down.

use super::error::WorkQueueError;
use crossbeam_channel::{Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

type WorkItem = Box<dyn FnOnce() + Send + 'static>;

/// Default number of items that may be queued
pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

/// Queue of one-shot work items run on a dedicated thread
pub struct RealTimeWorkQueue {
    name: String,
    sender: Option<Sender<WorkItem>>,
    thread: Option<JoinHandle<()>>,
    completed: Arc<AtomicU64>,
}

impl std::fmt::Debug for RealTimeWorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealTimeWorkQueue")
            .field("name", &self.name)
            .field("running", &self.sender.is_some())
            .field("completed", &self.completed())
            .finish()
    }
}

impl RealTimeWorkQueue {
    /// Start a worker thread named `name`
    ///
    /// # Arguments
    /// * `name` - Thread name
    /// * `capacity` - Items that may wait before `put_work_item` reports `Full`
    pub fn new(name: &str, capacity: usize) -> std::io::Result<Self> {
        let (sender, receiver) = crossbeam_channel::bounded::<WorkItem>(capacity.max(1));
        let completed = Arc::new(AtomicU64::new(0));
        let worker_completed = Arc::clone(&completed);
        let thread_name = name.to_string();

        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                for item in receiver.iter() {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(item));
                    if let Err(panic_info) = result {
                        let msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                            s.to_string()
                        } else if let Some(s) = panic_info.downcast_ref::<String>() {
                            s.clone()
                        } else {
                            "Unknown panic".to_string()
                        };
                        tracing::error!(queue = %thread_name, "Work item panicked: {}", msg);
                    }
                    worker_completed.fetch_add(1, Ordering::AcqRel);
                }
                tracing::debug!(queue = %thread_name, "Work queue drained");
            })?;

        tracing::debug!(queue = name, capacity, "Real-time work queue started");

        Ok(Self {
            name: name.to_string(),
            sender: Some(sender),
            thread: Some(thread),
            completed,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Post `work` without blocking
    pub fn put_work_item<F>(&self, work: F) -> Result<(), WorkQueueError>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.as_ref().ok_or(WorkQueueError::ShutDown)?;
        sender.try_send(Box::new(work)).map_err(|e| match e {
            TrySendError::Full(_) => WorkQueueError::Full,
            TrySendError::Disconnected(_) => WorkQueueError::ShutDown,
        })
    }

    /// Items that have finished running (including ones that panicked)
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Stop accepting work, run what is queued, and join the worker
    pub fn shutdown(&mut self) {
        self.sender.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!(queue = %self.name, "Work queue thread panicked");
            }
        }
    }
}

impl Drop for RealTimeWorkQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
