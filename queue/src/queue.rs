//! `BindingQueue` facade — the API consumed by request handlers.
//!
//! Callers submit keyed operations and get a [`BindingHandle`] back. The
//! queue owns the pending list, the context registry, and the dispatch loop's
//! lifecycle; it never owns the underlying connections (those live in the
//! payload and are torn down by the payload's `Drop`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bindq_types::{ContextKey, QueueSettings};
use tokio::sync::oneshot;

use crate::cancel::CancelSignal;
use crate::context::BindingContext;
use crate::dispatch::{PendingQueue, run_dispatch_loop};
use crate::error::QueueError;
use crate::fault::ContextHooks;
use crate::item::{
    BindingHandle, Completion, ErrorHandler, ItemId, TypedItem, Operation, TimeoutFallback,
};
use crate::registry::ContextRegistry;

/// Handles to a started dispatch loop.
struct Dispatcher {
    stop: CancelSignal,
    /// Raised by the loop task itself when it exits (including by panic).
    exited: CancelSignal,
}

/// Raises `exited` when the dispatch task ends, however it ends.
struct ExitGuard(CancelSignal);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Keyed binding queue.
///
/// Items sharing a key run one at a time in submission order; items with
/// different keys run concurrently. Every submitted item completes exactly
/// once, bounded by its timeouts.
pub struct BindingQueue<P: Send + 'static> {
    registry: Arc<ContextRegistry<P>>,
    pending: Arc<PendingQueue<P>>,
    next_id: AtomicU64,
    dispatcher: Mutex<Option<Dispatcher>>,
}

impl<P: Send + 'static> BindingQueue<P> {
    /// Build a queue with its own registry. Call [`BindingQueue::start`]
    /// before expecting items to run.
    pub fn new(settings: QueueSettings, hooks: impl ContextHooks<P>) -> Self {
        Self::with_registry(Arc::new(ContextRegistry::new(settings, hooks)))
    }

    /// Build a queue around an existing registry.
    #[must_use]
    pub fn with_registry(registry: Arc<ContextRegistry<P>>) -> Self {
        Self {
            registry,
            pending: Arc::new(PendingQueue::new()),
            next_id: AtomicU64::new(1),
            dispatcher: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ContextRegistry<P>> {
        &self.registry
    }

    #[must_use]
    pub fn settings(&self) -> QueueSettings {
        self.registry.settings()
    }

    fn dispatcher(&self) -> MutexGuard<'_, Option<Dispatcher>> {
        self.dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the dispatch loop on the current tokio runtime with a fresh
    /// stop signal. Also used to restart after [`BindingQueue::stop`].
    pub fn start(&self) -> Result<(), QueueError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| QueueError::NoRuntime)?;

        let mut slot = self.dispatcher();
        if let Some(current) = slot.as_ref()
            && !current.exited.is_cancelled()
        {
            return Err(if current.stop.is_cancelled() {
                QueueError::Stopping
            } else {
                QueueError::AlreadyRunning
            });
        }

        let stop = CancelSignal::new();
        let exited = CancelSignal::new();
        let guard = ExitGuard(exited.clone());
        let pending = Arc::clone(&self.pending);
        let registry = Arc::clone(&self.registry);
        let loop_stop = stop.clone();
        runtime.spawn(async move {
            let _guard = guard;
            run_dispatch_loop(pending, registry, loop_stop).await;
        });

        *slot = Some(Dispatcher { stop, exited });
        tracing::info!("Binding queue started");
        Ok(())
    }

    /// Ask the dispatch loop to stop and wait up to `timeout` for it to exit.
    ///
    /// Returns whether it exited in time. In-flight per-context operations
    /// are not interrupted; undispatched items stay queued for the next
    /// start (or [`BindingQueue::clear_pending`]).
    pub async fn stop(&self, timeout: Duration) -> bool {
        let (stop, exited) = match self.dispatcher().as_ref() {
            Some(current) => (current.stop.clone(), current.exited.clone()),
            None => return true,
        };

        stop.cancel();
        let exited_in_time = tokio::time::timeout(timeout, exited.cancelled())
            .await
            .is_ok();

        if exited_in_time {
            let mut slot = self.dispatcher();
            if slot
                .as_ref()
                .is_some_and(|current| current.exited.is_cancelled())
            {
                *slot = None;
            }
            tracing::info!("Binding queue stopped");
        } else {
            tracing::warn!(
                timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                "Binding dispatch loop did not stop in time"
            );
        }
        exited_in_time
    }

    /// [`BindingQueue::stop`] with the configured stop timeout.
    pub async fn stop_default(&self) -> bool {
        self.stop(self.settings().stop_timeout()).await
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.dispatcher()
            .as_ref()
            .is_some_and(|current| !current.stop.is_cancelled() && !current.exited.is_cancelled())
    }

    /// Submit `operation` for `key` with default timeouts and no fallbacks.
    pub fn submit<T, F>(&self, key: impl Into<ContextKey>, operation: F) -> BindingHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut P, &CancelSignal) -> anyhow::Result<T> + Send + 'static,
    {
        self.submission(key, operation).submit()
    }

    /// Start describing a submission; finish with [`Submission::submit`].
    pub fn submission<T, F>(&self, key: impl Into<ContextKey>, operation: F) -> Submission<'_, P, T>
    where
        T: Send + 'static,
        F: FnOnce(&mut P, &CancelSignal) -> anyhow::Result<T> + Send + 'static,
    {
        Submission {
            queue: self,
            key: key.into(),
            operation: Box::new(operation),
            on_timeout: None,
            on_error: None,
            timeout: None,
            lock_wait: None,
        }
    }

    fn enqueue<T: Send + 'static>(&self, submission: Submission<'_, P, T>) -> BindingHandle<T> {
        let id = ItemId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        let Submission {
            queue: _,
            key,
            operation,
            on_timeout,
            on_error,
            timeout,
            lock_wait,
        } = submission;

        let handle = BindingHandle::new(id, key.clone(), rx);
        let typed = TypedItem {
            id,
            key,
            operation,
            on_timeout,
            on_error,
            timeout,
            lock_wait,
            completion: Completion::new(tx),
        };
        tracing::trace!(key = %handle.key(), item = %id, "Queued binding item");
        self.pending.push(typed.into_queued());
        handle
    }

    /// Drop every item not yet dispatched. In-flight items are unaffected.
    pub fn clear_pending(&self) -> usize {
        let cleared = self.pending.clear();
        if cleared > 0 {
            tracing::debug!(cleared, "Cleared pending binding items");
        }
        cleared
    }

    #[must_use]
    pub fn has_pending_items(&self) -> bool {
        !self.pending.is_empty()
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Register (or fetch) the context for `key` and mark it connected.
    ///
    /// Called by the owning service once it has a live connection for the key.
    pub fn add_context(&self, key: impl Into<ContextKey>) -> Arc<BindingContext<P>> {
        let context = self.registry.get_or_create(key);
        context.set_connected(true);
        context
    }

    #[must_use]
    pub fn context(&self, key: impl Into<ContextKey>) -> Option<Arc<BindingContext<P>>> {
        self.registry.get(key)
    }

    #[must_use]
    pub fn context_count(&self) -> usize {
        self.registry.len()
    }

    #[must_use]
    pub fn is_context_connected(&self, key: impl Into<ContextKey>) -> bool {
        self.registry
            .get(key)
            .is_some_and(|context| context.is_connected())
    }

    /// Evict the context for `key`. An operation already running on it
    /// finishes; items queued behind it resolve as `Discarded`. Later
    /// submissions get a fresh context.
    pub fn remove_context(&self, key: impl Into<ContextKey>) -> bool {
        self.registry.remove(key).is_some()
    }

    /// Close every context whose key matches `predicate`.
    ///
    /// Each context is only evicted after its gate is acquired within
    /// `lock_wait`, so no operation is running against it at eviction time.
    /// Contexts that stay busy are left in place. Returns how many closed.
    pub async fn close_contexts<F>(&self, predicate: F, lock_wait: Duration) -> usize
    where
        F: Fn(&ContextKey) -> bool,
    {
        let mut closed = 0;
        for key in self.registry.keys() {
            if !predicate(&key) {
                continue;
            }
            let Some(context) = self.registry.get(key.clone()) else {
                continue;
            };
            let Some(guard) = context.acquire(lock_wait).await else {
                tracing::warn!(key = %key, "Skipping close: binding context still busy");
                continue;
            };
            if self.registry.remove_if_current(&context) {
                closed += 1;
                tracing::debug!(key = %key, "Closed binding context");
            }
            drop(guard);
        }
        closed
    }
}

impl<P: Send + 'static> Drop for BindingQueue<P> {
    fn drop(&mut self) {
        // Raise stop without waiting; in-flight operations finish on their own.
        if let Some(current) = self.dispatcher().take() {
            current.stop.cancel();
        }
    }
}

/// Builder for a single submission.
#[must_use = "a submission does nothing until `submit` is called"]
pub struct Submission<'q, P: Send + 'static, T> {
    queue: &'q BindingQueue<P>,
    key: ContextKey,
    operation: Operation<P, T>,
    on_timeout: Option<TimeoutFallback<P, T>>,
    on_error: Option<ErrorHandler<T>>,
    timeout: Option<Duration>,
    lock_wait: Option<Duration>,
}

impl<P: Send + 'static, T: Send + 'static> Submission<'_, P, T> {
    /// Value to use when the gate wait or the operation times out.
    pub fn on_timeout<F>(mut self, fallback: F) -> Self
    where
        F: FnOnce(&BindingContext<P>) -> T + Send + 'static,
    {
        self.on_timeout = Some(Box::new(fallback));
        self
    }

    /// Value to use when the operation fails or panics.
    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: FnOnce(&anyhow::Error) -> T + Send + 'static,
    {
        self.on_error = Some(Box::new(handler));
        self
    }

    /// Overrides the context's default timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Overrides the queue's default lock-wait budget.
    pub fn lock_wait(mut self, lock_wait: Duration) -> Self {
        self.lock_wait = Some(lock_wait);
        self
    }

    pub fn submit(self) -> BindingHandle<T> {
        self.queue.enqueue(self)
    }
}
