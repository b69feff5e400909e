//! Commit-up: saving a context and then each of its ancestors.
//!
//! Every hop finishes before the next hop starts. Changes leave a context
//! on its own queue and arrive on the parent's queue; no queue ever blocks
//! waiting on a descendant's queue. When a hop hands changes to a parent,
//! change listeners are told on the parent's queue, with the parent as the
//! origin.

use super::Context;
use crate::error::{Error, Result};
use tokio::sync::oneshot;
use tracing::debug;

type Completion = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Runs a completion exactly once.
///
/// If the guard is dropped before it is called, for instance because a queue
/// stopped and discarded the job holding it, the completion receives
/// `ContextUnavailable`.
struct CompletionGuard {
    label: String,
    completion: Option<Completion>,
}

impl CompletionGuard {
    fn new(label: &str, completion: Completion) -> Self {
        Self {
            label: label.to_string(),
            completion: Some(completion),
        }
    }

    fn call(mut self, result: Result<()>) {
        if let Some(completion) = self.completion.take() {
            completion(result);
        }
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if let Some(completion) = self.completion.take() {
            completion(Err(Error::ContextUnavailable(self.label.clone())));
        }
    }
}

impl Context {
    /// Save this context and every ancestor, blocking until the main
    /// context has committed.
    ///
    /// A context without pending changes is a no-op. If a hop fails, the
    /// error is returned and no further ancestor is saved. Ancestors saved
    /// below the failing hop keep what they received.
    ///
    /// May be called from any queue, including the queue of an ancestor.
    ///
    /// # Errors
    ///
    /// Returns the error of the first failing hop.
    pub fn save_to_store(&self) -> Result<()> {
        if !self.has_changes() {
            return Ok(());
        }

        let mut current = self.clone();
        loop {
            current.save()?;
            let Some(parent) = current.parent().cloned() else {
                break;
            };
            parent.perform_and_wait(|parent| parent.bus().post_changes(parent))?;
            current = parent;
        }
        debug!(context = %self.id(), "Saved to store");
        Ok(())
    }

    /// Save this context and every ancestor without blocking.
    ///
    /// Each hop is scheduled on its context's own queue and chains the next
    /// hop when it finishes. `completion` runs on the main context's queue
    /// with the outcome of the whole chain.
    pub fn save_to_store_with<F>(&self, completion: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let guard = CompletionGuard::new(self.main_queue().label(), Box::new(completion));
        if !self.has_changes() {
            finish(self, guard, Ok(()));
            return;
        }
        schedule_hop(self.clone(), guard);
    }

    /// Async form of [`Context::save_to_store_with`].
    ///
    /// # Errors
    ///
    /// Returns the error of the first failing hop, or `ContextUnavailable`
    /// if a queue stopped before the chain finished.
    pub async fn save_to_store_async(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.save_to_store_with(move |result| {
            let _ = tx.send(result);
        });
        rx.await
            .map_err(|_| Error::ContextUnavailable(self.main_queue().label().to_string()))?
    }
}

fn schedule_hop(ctx: Context, guard: CompletionGuard) {
    let queue = ctx.queue().clone();
    // A failed enqueue drops the job, and with it the guard.
    let _ = queue.perform(move || run_hop(ctx, guard));
}

/// One hop of the callback chain. Runs on `ctx`'s queue and never blocks.
fn run_hop(ctx: Context, guard: CompletionGuard) {
    let Some(parent) = ctx.parent().cloned() else {
        let result = ctx.commit_pending().map(|_| ());
        finish(&ctx, guard, result);
        return;
    };

    let changes = ctx.take_pending();
    let from = ctx.id();
    let _ = parent.perform(move |parent| {
        parent.receive(from, changes);
        parent.bus().post_changes(parent);
        run_hop(parent.clone(), guard);
    });
}

fn finish(ctx: &Context, guard: CompletionGuard, result: Result<()>) {
    let _ = ctx.main_queue().perform(move || guard.call(result));
}
