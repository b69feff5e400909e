//! Change notification fan-out.
//!
//! Commits are published two ways:
//! - Registered callbacks, invoked in registration order
//! - [`StoreEvent`] values on a broadcast channel, for subsystems that
//!   prefer to consume commits as messages
//!
//! Both registries are append-only and live as long as the bus.

use crate::context::{Context, ContextId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Default broadcast channel capacity.
const DEFAULT_CAPACITY: usize = 256;

/// Callback for "a context produced changes".
pub type ChangeListener = dyn Fn(&Context) + Send + Sync;

/// Callback for "the main context was saved".
pub type SaveListener = dyn Fn(&Context, &SaveInfo) + Send + Sync;

/// Metadata describing one durable commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SaveInfo {
    pub context: ContextId,
    pub changes: usize,
    pub committed_at: DateTime<Utc>,
}

/// A commit, as a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// Changes were handed to `origin` by one of its children.
    Changed { origin: ContextId },
    /// The main context committed to the store.
    Saved(SaveInfo),
}

/// Process-scoped registry of commit observers.
pub struct NotificationBus {
    change_listeners: RwLock<Vec<Arc<ChangeListener>>>,
    save_listeners: RwLock<Vec<Arc<SaveListener>>>,
    saves_armed: AtomicBool,
    tx: broadcast::Sender<StoreEvent>,
}

impl std::fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationBus")
            .field("change_listeners", &self.change_listener_count())
            .field("save_listeners", &self.save_listener_count())
            .field("saves_armed", &self.saves_armed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationBus {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus whose broadcast channel holds `capacity` events.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            change_listeners: RwLock::new(Vec::new()),
            save_listeners: RwLock::new(Vec::new()),
            saves_armed: AtomicBool::new(false),
            tx,
        }
    }

    /// Register a listener for changes flowing up the context tree.
    pub fn add_change_listener<F>(&self, listener: F)
    where
        F: Fn(&Context) + Send + Sync + 'static,
    {
        self.change_listeners
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(Arc::new(listener));
    }

    /// Register a listener for durable saves of the main context.
    pub fn add_save_listener<F>(&self, listener: F)
    where
        F: Fn(&Context, &SaveInfo) + Send + Sync + 'static,
    {
        self.save_listeners
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(Arc::new(listener));
    }

    /// Receive every event published after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.tx.subscribe()
    }

    #[must_use]
    pub fn change_listener_count(&self) -> usize {
        self.change_listeners
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn save_listener_count(&self) -> usize {
        self.save_listeners
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Start delivering save notifications. Called once the store has started.
    pub fn arm_save_listeners(&self) {
        self.saves_armed.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn save_listeners_armed(&self) -> bool {
        self.saves_armed.load(Ordering::Acquire)
    }

    /// Notify change listeners that `origin` received changes.
    pub fn post_changes(&self, origin: &Context) {
        let listeners = self
            .change_listeners
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();

        debug!(origin = %origin.id(), listeners = listeners.len(), "Posting changes");
        for (index, listener) in listeners.iter().enumerate() {
            if panic::catch_unwind(AssertUnwindSafe(|| listener(origin))).is_err() {
                warn!(index, origin = %origin.id(), "Change listener panicked");
            }
        }

        let _ = self.tx.send(StoreEvent::Changed {
            origin: origin.id(),
        });
    }

    /// Notify save listeners that `context` committed to the store.
    pub fn post_saved(&self, context: &Context, info: &SaveInfo) {
        if !self.save_listeners_armed() {
            return;
        }

        let listeners = self
            .save_listeners
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();

        for (index, listener) in listeners.iter().enumerate() {
            if panic::catch_unwind(AssertUnwindSafe(|| listener(context, info))).is_err() {
                warn!(index, context = %context.id(), "Save listener panicked");
            }
        }

        let _ = self.tx.send(StoreEvent::Saved(info.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::main_context;
    use std::sync::Mutex;

    fn info(context: &Context) -> SaveInfo {
        SaveInfo {
            context: context.id(),
            changes: 1,
            committed_at: Utc::now(),
        }
    }

    #[test]
    fn test_listeners_run_in_registration_order() {
        let main = main_context();
        let bus = NotificationBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let seen = Arc::clone(&seen);
            bus.add_change_listener(move |_| seen.lock().unwrap().push(i));
        }

        bus.post_changes(&main);
        bus.post_changes(&main);

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 0, 1, 2]);
        assert_eq!(bus.change_listener_count(), 3);
    }

    #[test]
    fn test_panicking_listener_does_not_stop_others() {
        let main = main_context();
        let bus = NotificationBus::new();
        let calls = Arc::new(Mutex::new(0));
        bus.add_change_listener(|_| panic!("listener failure"));
        let counter = Arc::clone(&calls);
        bus.add_change_listener(move |_| *counter.lock().unwrap() += 1);

        bus.post_changes(&main);

        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[test]
    fn test_save_listeners_wait_until_armed() {
        let main = main_context();
        let bus = NotificationBus::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        bus.add_save_listener(move |ctx, info| sink.lock().unwrap().push((ctx.id(), info.changes)));
        let mut events = bus.subscribe();

        bus.post_saved(&main, &info(&main));
        assert!(calls.lock().unwrap().is_empty());
        assert!(events.try_recv().is_err());

        bus.arm_save_listeners();
        bus.post_saved(&main, &info(&main));
        assert_eq!(*calls.lock().unwrap(), vec![(main.id(), 1)]);
        assert!(matches!(events.try_recv(), Ok(StoreEvent::Saved(saved)) if saved.context == main.id()));
    }

    #[test]
    fn test_events_reach_every_subscriber() {
        let main = main_context();
        let bus = NotificationBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.post_changes(&main);

        let expected = StoreEvent::Changed { origin: main.id() };
        assert_eq!(first.try_recv().unwrap(), expected);
        assert_eq!(second.try_recv().unwrap(), expected);
    }

    #[test]
    fn test_save_info_serializes() {
        let main = main_context();
        let json = serde_json::to_value(info(&main)).unwrap();
        assert_eq!(json["changes"], 1);
        assert!(json["context"].is_u64());
        assert!(json["committed_at"].is_string());
    }
}
