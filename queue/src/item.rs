//! Queue items, their completion plumbing, and the caller-side handle.
//!
//! A submitted item is typed by its result `T` until it enters the pending
//! queue; there it is erased into a [`QueuedItem`] so items of different
//! result types can share one queue and one per-context executor.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bindq_types::ContextKey;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::oneshot;

use crate::cancel::CancelSignal;
use crate::context::BindingContext;
use crate::executor::{self, ExecutionEnv};

pub(crate) type Operation<P, T> =
    Box<dyn FnOnce(&mut P, &CancelSignal) -> anyhow::Result<T> + Send + 'static>;
pub(crate) type TimeoutFallback<P, T> =
    Box<dyn FnOnce(&BindingContext<P>) -> T + Send + 'static>;
pub(crate) type ErrorHandler<T> = Box<dyn FnOnce(&anyhow::Error) -> T + Send + 'static>;

type Runner<P> =
    Box<dyn FnOnce(Arc<BindingContext<P>>, ExecutionEnv<P>) -> BoxFuture<'static, ()> + Send>;

/// Submission sequence number, unique per queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId(u64);

impl ItemId {
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which path terminated an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The operation returned a value within its timeout.
    Completed,
    /// The gate could not be acquired within the lock-wait budget; the
    /// operation never ran and the value (if any) came from the fallback.
    LockTimedOut,
    /// The operation overran its timeout; cancellation was requested and the
    /// value (if any) came from the fallback.
    TimedOut,
    /// The operation returned an error or panicked; the value (if any) came
    /// from the error handler. `fatal` is set when the error was classified
    /// as connection-fatal and the context was evicted.
    Faulted { fatal: bool },
    /// The item was dropped before it ran: cleared from the pending queue,
    /// left behind when its queue was dropped, or abandoned by a panicking
    /// callback.
    Discarded,
}

impl Resolution {
    #[must_use]
    pub fn is_completed(self) -> bool {
        self == Self::Completed
    }

    /// Whether the value was produced by the timeout fallback.
    #[must_use]
    pub fn is_fallback(self) -> bool {
        matches!(self, Self::LockTimedOut | Self::TimedOut)
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::LockTimedOut => "lock-timed-out",
            Self::TimedOut => "timed-out",
            Self::Faulted { fatal: false } => "faulted",
            Self::Faulted { fatal: true } => "faulted-fatal",
            Self::Discarded => "discarded",
        }
    }
}

/// The result slot of a finished item.
#[derive(Debug)]
pub struct BindingOutcome<T> {
    value: Option<T>,
    resolution: Resolution,
}

impl<T> BindingOutcome<T> {
    pub(crate) fn new(value: Option<T>, resolution: Resolution) -> Self {
        Self { value, resolution }
    }

    pub(crate) fn discarded() -> Self {
        Self::new(None, Resolution::Discarded)
    }

    #[must_use]
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    #[must_use]
    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    #[must_use]
    pub fn into_value(self) -> Option<T> {
        self.value
    }

    /// The value, or `T::default()` when no path produced one.
    #[must_use]
    pub fn into_value_or_default(self) -> T
    where
        T: Default,
    {
        self.value.unwrap_or_default()
    }
}

/// Sender half of an item's completion signal.
///
/// Signals exactly once: either through [`Completion::complete`] or, if the
/// item is dropped on any other path (cleared, queue dropped, a callback
/// panicked), with [`Resolution::Discarded`] from `Drop`.
pub(crate) struct Completion<T> {
    tx: Option<oneshot::Sender<BindingOutcome<T>>>,
}

impl<T> Completion<T> {
    pub(crate) fn new(tx: oneshot::Sender<BindingOutcome<T>>) -> Self {
        Self { tx: Some(tx) }
    }

    pub(crate) fn complete(mut self, outcome: BindingOutcome<T>) {
        if let Some(tx) = self.tx.take() {
            // Receiver gone means the caller stopped caring; nothing to do.
            let _ = tx.send(outcome);
        }
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(BindingOutcome::discarded());
        }
    }
}

/// Caller-side handle to a submitted item.
#[must_use = "dropping the handle discards the item's result"]
pub struct BindingHandle<T> {
    id: ItemId,
    key: ContextKey,
    rx: oneshot::Receiver<BindingOutcome<T>>,
}

impl<T> fmt::Debug for BindingHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingHandle")
            .field("id", &self.id)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl<T> BindingHandle<T> {
    pub(crate) fn new(
        id: ItemId,
        key: ContextKey,
        rx: oneshot::Receiver<BindingOutcome<T>>,
    ) -> Self {
        Self { id, key, rx }
    }

    #[must_use]
    pub fn id(&self) -> ItemId {
        self.id
    }

    #[must_use]
    pub fn key(&self) -> &ContextKey {
        &self.key
    }

    /// Wait for the item to finish.
    pub async fn wait(self) -> BindingOutcome<T> {
        self.rx.await.unwrap_or_else(|_| BindingOutcome::discarded())
    }

    /// Wait up to `timeout`. On elapse the handle is returned so the caller
    /// can keep waiting later.
    pub async fn wait_timeout(mut self, timeout: Duration) -> Result<BindingOutcome<T>, Self> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Ok(BindingOutcome::discarded()),
            Err(_) => Err(self),
        }
    }

    /// Blocking wait for callers outside the async runtime.
    ///
    /// # Panics
    ///
    /// Panics when called from within an asynchronous execution context.
    pub fn wait_blocking(self) -> BindingOutcome<T> {
        self.rx
            .blocking_recv()
            .unwrap_or_else(|_| BindingOutcome::discarded())
    }

    /// Blocking wait bounded by `timeout`, for callers outside the async
    /// runtime. On elapse the handle is returned so the caller can keep
    /// waiting later.
    ///
    /// # Panics
    ///
    /// Panics when called from within an asynchronous execution context.
    pub fn wait_blocking_timeout(self, timeout: Duration) -> Result<BindingOutcome<T>, Self> {
        // A private current-thread runtime only drives this one timer; the
        // item itself keeps running on the queue's runtime.
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
        {
            Ok(runtime) => runtime,
            Err(err) => {
                tracing::warn!("Failed to build timer runtime for blocking wait: {err}");
                return Err(self);
            }
        };
        runtime.block_on(self.wait_timeout(timeout))
    }

    /// Take the outcome if the item already finished.
    pub fn try_outcome(mut self) -> Result<BindingOutcome<T>, Self> {
        match self.rx.try_recv() {
            Ok(outcome) => Ok(outcome),
            Err(oneshot::error::TryRecvError::Closed) => Ok(BindingOutcome::discarded()),
            Err(oneshot::error::TryRecvError::Empty) => Err(self),
        }
    }
}

/// A fully described, still-typed unit of work.
pub(crate) struct TypedItem<P, T> {
    pub(crate) id: ItemId,
    pub(crate) key: ContextKey,
    pub(crate) operation: Operation<P, T>,
    pub(crate) on_timeout: Option<TimeoutFallback<P, T>>,
    pub(crate) on_error: Option<ErrorHandler<T>>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) lock_wait: Option<Duration>,
    pub(crate) completion: Completion<T>,
}

impl<P, T> TypedItem<P, T>
where
    P: Send + 'static,
    T: Send + 'static,
{
    pub(crate) fn into_queued(self) -> QueuedItem<P> {
        let id = self.id;
        let key = self.key.clone();
        QueuedItem {
            id,
            key,
            run: Box::new(
                move |context: Arc<BindingContext<P>>, env: ExecutionEnv<P>| {
                    executor::supervise(self, context, env).boxed()
                },
            ),
        }
    }
}

/// Type-erased item as it sits in the pending queue and executor channels.
pub(crate) struct QueuedItem<P> {
    id: ItemId,
    key: ContextKey,
    run: Runner<P>,
}

impl<P> QueuedItem<P> {
    pub(crate) fn id(&self) -> ItemId {
        self.id
    }

    pub(crate) fn key(&self) -> &ContextKey {
        &self.key
    }

    pub(crate) fn run(
        self,
        context: Arc<BindingContext<P>>,
        env: ExecutionEnv<P>,
    ) -> BoxFuture<'static, ()> {
        (self.run)(context, env)
    }
}
