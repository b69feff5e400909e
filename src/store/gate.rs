//! One-shot startup completions.

use crate::context::SerialQueue;
use std::sync::Mutex;
use tracing::{debug, warn};

type ReadyCallback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct GateState {
    ready: bool,
    pending: Vec<ReadyCallback>,
}

/// Holds callers until the store has started.
///
/// Completions registered before release run once, in registration order,
/// on the queue passed to [`StartupGate::release`]. Completions registered
/// afterwards run immediately on the caller's thread.
#[derive(Default)]
pub struct StartupGate {
    state: Mutex<GateState>,
}

impl std::fmt::Debug for StartupGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartupGate")
            .field("ready", &self.is_ready())
            .field("pending", &self.pending_len())
            .finish()
    }
}

impl StartupGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_ready<F>(&self, completion: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.lock();
            if !state.ready {
                state.pending.push(Box::new(completion));
                return;
            }
        }
        completion();
    }

    /// Mark the gate open and drain queued completions onto `queue`.
    ///
    /// Completions queued concurrently with the release are drained too.
    /// Calling this again is a no-op.
    pub fn release(&self, queue: &SerialQueue) {
        let pending = {
            let mut state = self.lock();
            if state.ready {
                return;
            }
            state.ready = true;
            std::mem::take(&mut state.pending)
        };

        debug!(count = pending.len(), queue = queue.label(), "Releasing startup completions");
        if pending.is_empty() {
            return;
        }

        let drain = move || {
            for completion in pending {
                completion();
            }
        };
        if queue.is_current() {
            drain();
        } else if queue.perform(drain).is_err() {
            warn!(queue = queue.label(), "Queue stopped before startup completions ran");
        }
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.lock().ready
    }

    /// Completions still waiting for release.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GateState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::thread;

    #[test]
    fn test_queued_completions_run_once_in_order() {
        let gate = StartupGate::new();
        let queue = SerialQueue::new("ui").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let seen = Arc::clone(&seen);
            let queue = queue.clone();
            gate.on_ready(move || seen.lock().unwrap().push((i, queue.is_current())));
        }
        assert_eq!(gate.pending_len(), 5);
        assert!(seen.lock().unwrap().is_empty());

        gate.release(&queue);
        gate.release(&queue);
        queue.perform_and_wait(|| ()).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, (0..5).map(|i| (i, true)).collect::<Vec<_>>());
        assert_eq!(gate.pending_len(), 0);
    }

    #[test]
    fn test_completion_after_release_runs_immediately() {
        let gate = StartupGate::new();
        let queue = SerialQueue::new("ui").unwrap();
        gate.release(&queue);
        assert!(gate.is_ready());

        let caller = thread::current().id();
        let ran_on = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&ran_on);
        gate.on_ready(move || *sink.lock().unwrap() = Some(thread::current().id()));

        assert_eq!(*ran_on.lock().unwrap(), Some(caller));
    }
}
