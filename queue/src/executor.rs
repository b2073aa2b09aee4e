//! Per-context serial executor and the timeout supervisor it runs each item
//! under.
//!
//! # Item lifecycle
//!
//! ```text
//! routed ─► gate wait ─┬─► lock timed out ─► fallback ──────────────────────► done
//!                      └─► gate held ─► running ─┬─► completed ────────────► done
//!                                                ├─► timed out ─► fallback ─► done
//!                                                │               └─► await late return
//!                                                └─► faulted ─► error handler
//!                                                               [+ evict] ─► done
//! ```
//!
//! The gate guard moves into the operation, so the gate reopens exactly when
//! the operation returns. A timed-out operation therefore keeps the gate
//! until it actually finishes and can never overlap the next item for the
//! same key.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bindq_types::{ContextKey, QueueSettings};
use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};

use crate::cancel::CancelSignal;
use crate::context::BindingContext;
use crate::fault::ContextHooks;
use crate::item::{BindingOutcome, ErrorHandler, ItemId, TypedItem, QueuedItem, Resolution};
use crate::registry::ContextRegistry;

/// What an executor needs beyond its own context.
pub(crate) struct ExecutionEnv<P> {
    /// Weak so executor tasks never keep a dropped queue's registry alive.
    registry: Weak<ContextRegistry<P>>,
    hooks: Arc<dyn ContextHooks<P>>,
    lock_wait: Duration,
    late_completion_grace: Duration,
}

impl<P> Clone for ExecutionEnv<P> {
    fn clone(&self) -> Self {
        Self {
            registry: Weak::clone(&self.registry),
            hooks: Arc::clone(&self.hooks),
            lock_wait: self.lock_wait,
            late_completion_grace: self.late_completion_grace,
        }
    }
}

impl<P> ExecutionEnv<P> {
    pub(crate) fn new(
        registry: Weak<ContextRegistry<P>>,
        hooks: Arc<dyn ContextHooks<P>>,
        settings: QueueSettings,
    ) -> Self {
        Self {
            registry,
            hooks,
            lock_wait: settings.lock_wait_timeout(),
            late_completion_grace: settings.late_completion_grace(),
        }
    }
}

pub(crate) fn panic_payload_to_string(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Spawn the single worker that runs `context`'s items one at a time, in the
/// order they were sent. The worker exits once every sender is dropped and
/// the channel is drained.
///
/// Once the context is evicted, items still in the channel are dropped
/// unrun (their waiters see `Discarded`). Later submissions for the key go
/// to a fresh context, so an evicted context never runs work in parallel
/// with its replacement.
pub(crate) fn spawn_serial_executor<P: Send + 'static>(
    context: Arc<BindingContext<P>>,
    env: ExecutionEnv<P>,
) -> mpsc::UnboundedSender<QueuedItem<P>> {
    let (tx, mut rx) = mpsc::unbounded_channel::<QueuedItem<P>>();

    tokio::spawn(async move {
        tracing::debug!(key = %context.key(), "Serial executor started");
        while let Some(item) = rx.recv().await {
            let id = item.id();
            if context.is_evicted() {
                tracing::debug!(
                    key = %context.key(),
                    item = %id,
                    "Discarding binding item routed to an evicted context"
                );
                drop(item);
                continue;
            }
            let run = AssertUnwindSafe(item.run(Arc::clone(&context), env.clone())).catch_unwind();
            if let Err(panic) = run.await {
                // The item's completion was dropped during unwinding, so its
                // waiter already saw Discarded.
                tracing::error!(
                    key = %context.key(),
                    item = %id,
                    "Binding item callback panicked: {}",
                    panic_payload_to_string(panic.as_ref())
                );
            }
        }
        tracing::debug!(key = %context.key(), "Serial executor stopped");
    });

    tx
}

/// Run one item against `context` and signal its completion.
pub(crate) async fn supervise<P, T>(
    item: TypedItem<P, T>,
    context: Arc<BindingContext<P>>,
    env: ExecutionEnv<P>,
) where
    P: Send + 'static,
    T: Send + 'static,
{
    let TypedItem {
        id,
        key: _,
        operation,
        on_timeout,
        on_error,
        timeout,
        lock_wait,
        completion,
    } = item;
    let key = context.key().clone();
    let timeout = timeout.unwrap_or_else(|| context.default_timeout());
    let lock_wait = lock_wait.unwrap_or(env.lock_wait);

    let Some(guard) = context.acquire(lock_wait).await else {
        tracing::warn!(
            key = %key,
            item = %id,
            lock_wait_ms = millis(lock_wait),
            "Binding gate wait timed out; running fallback"
        );
        let value = on_timeout.map(|fallback| fallback(&*context));
        completion.complete(BindingOutcome::new(value, Resolution::LockTimedOut));
        return;
    };

    let cancel = CancelSignal::new();
    let op_cancel = cancel.clone();
    let started = Instant::now();
    let mut join = tokio::task::spawn_blocking(move || {
        let mut guard = guard;
        operation(&mut *guard, &op_cancel)
    });

    let joined = match tokio::time::timeout(timeout, &mut join).await {
        Ok(joined) => joined,
        Err(_) => {
            cancel.cancel();
            tracing::warn!(
                key = %key,
                item = %id,
                timeout_ms = millis(timeout),
                "Binding operation timed out; cancellation requested"
            );
            let value = on_timeout.map(|fallback| fallback(&*context));
            completion.complete(BindingOutcome::new(value, Resolution::TimedOut));
            await_late_completion(join, env.late_completion_grace, &key, id).await;
            return;
        }
    };

    let outcome = match joined {
        Ok(Ok(value)) => {
            tracing::debug!(
                key = %key,
                item = %id,
                elapsed_ms = millis(started.elapsed()),
                "Binding operation completed"
            );
            BindingOutcome::new(Some(value), Resolution::Completed)
        }
        Ok(Err(err)) => handle_fault(err, on_error, &context, &env, id),
        Err(join_err) => {
            let err = join_error_to_anyhow(join_err);
            handle_fault(err, on_error, &context, &env, id)
        }
    };
    completion.complete(outcome);
}

fn join_error_to_anyhow(err: JoinError) -> anyhow::Error {
    match err.try_into_panic() {
        Ok(payload) => anyhow::anyhow!(
            "binding operation panicked: {}",
            panic_payload_to_string(payload.as_ref())
        ),
        Err(err) => anyhow::anyhow!("binding operation was cancelled: {err}"),
    }
}

/// Error handler, classification, and (for connection-fatal errors) eviction
/// plus owner notification.
fn handle_fault<P, T>(
    err: anyhow::Error,
    on_error: Option<ErrorHandler<T>>,
    context: &Arc<BindingContext<P>>,
    env: &ExecutionEnv<P>,
    id: ItemId,
) -> BindingOutcome<T>
where
    P: Send + 'static,
{
    let key = context.key();
    let value = on_error.map(|handler| handler(&err));
    let fatal = env.hooks.is_connection_fatal(&err);

    if !fatal {
        tracing::warn!(key = %key, item = %id, "Binding operation failed: {err:#}");
        return BindingOutcome::new(value, Resolution::Faulted { fatal: false });
    }

    let evicted = match env.registry.upgrade() {
        Some(registry) => registry.remove_if_current(context),
        None => {
            context.mark_evicted();
            false
        }
    };
    tracing::warn!(
        key = %key,
        item = %id,
        evicted,
        age_ms = millis(context.created_at().elapsed()),
        "Connection-fatal binding failure; context evicted: {err:#}"
    );
    env.hooks.on_connection_fatal(key, &err);
    BindingOutcome::new(value, Resolution::Faulted { fatal: true })
}

/// Keep the executor on this key busy until the timed-out operation returns,
/// bounded by `grace`. Whatever it returns now is only logged.
async fn await_late_completion<T>(
    join: JoinHandle<anyhow::Result<T>>,
    grace: Duration,
    key: &ContextKey,
    id: ItemId,
) {
    match tokio::time::timeout(grace, join).await {
        Ok(Ok(Ok(_))) => {
            tracing::debug!(key = %key, item = %id, "Timed-out binding operation returned late");
        }
        Ok(Ok(Err(err))) => {
            tracing::warn!(key = %key, item = %id, "Timed-out binding operation failed late: {err:#}");
        }
        Ok(Err(join_err)) => {
            tracing::warn!(
                key = %key,
                item = %id,
                "Timed-out binding operation ended abnormally: {}",
                join_error_to_anyhow(join_err)
            );
        }
        Err(_) => {
            tracing::warn!(
                key = %key,
                item = %id,
                grace_ms = millis(grace),
                "Timed-out binding operation still running; gate stays closed until it returns"
            );
        }
    }
}
