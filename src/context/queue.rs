//! Serial execution domains.
//!
//! Every context is bound to one [`SerialQueue`]: a dedicated thread that
//! runs submitted jobs one at a time, in submission order. The main
//! context's queue doubles as the UI-affine domain on which startup
//! completions run.

use crate::error::{Error, Result};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc::{self, Sender};
use std::thread::{self, ThreadId};
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct QueueInner {
    label: String,
    tx: Sender<Job>,
    thread: ThreadId,
}

/// Handle to a single-threaded FIFO executor. Cheap to clone.
///
/// The worker thread exits once every handle is dropped and the pending
/// jobs have run.
#[derive(Clone)]
pub struct SerialQueue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialQueue")
            .field("label", &self.inner.label)
            .finish_non_exhaustive()
    }
}

impl SerialQueue {
    /// Spawn a new queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker thread cannot be spawned.
    pub fn new(label: &str) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        let handle = thread::Builder::new()
            .name(format!("storestack.{label}"))
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                        warn!("Job panicked on serial queue");
                    }
                }
            })?;

        debug!(label, "Spawned serial queue");
        Ok(Self {
            inner: Arc::new(QueueInner {
                label: label.to_string(),
                tx,
                thread: handle.thread().id(),
            }),
        })
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Whether the calling thread is this queue's worker.
    #[must_use]
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.inner.thread
    }

    /// Enqueue `job` without waiting for it.
    ///
    /// # Errors
    ///
    /// Returns `ContextUnavailable` if the worker has exited; the job is dropped.
    pub fn perform<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.tx.send(Box::new(job)).map_err(|_| {
            warn!(label = %self.inner.label, "Queue is no longer running");
            Error::ContextUnavailable(self.inner.label.clone())
        })
    }

    /// Run `job` on the queue and wait for its result.
    ///
    /// Runs inline when called from the queue's own thread.
    ///
    /// # Errors
    ///
    /// Returns `ContextUnavailable` if the worker has exited or the job panicked.
    pub fn perform_and_wait<F, R>(&self, job: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current() {
            return Ok(job());
        }

        let (result_tx, result_rx) = mpsc::sync_channel(1);
        self.perform(move || {
            let _ = result_tx.send(job());
        })?;
        result_rx
            .recv()
            .map_err(|_| Error::ContextUnavailable(self.inner.label.clone()))
    }
}
