//! Pending queue and the single dispatch loop that drains it.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::cancel::CancelSignal;
use crate::executor::panic_payload_to_string;
use crate::item::QueuedItem;
use crate::registry::ContextRegistry;

/// Items submitted but not yet handed to a context's executor.
pub(crate) struct PendingQueue<P> {
    items: Mutex<VecDeque<QueuedItem<P>>>,
    work_available: Notify,
}

impl<P> PendingQueue<P> {
    pub(crate) fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            work_available: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<QueuedItem<P>>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn push(&self, item: QueuedItem<P>) {
        self.lock().push_back(item);
        // notify_one stores a permit when the loop is not parked yet, so a
        // push racing with the loop's emptiness check is never lost.
        self.work_available.notify_one();
    }

    pub(crate) fn pop(&self) -> Option<QueuedItem<P>> {
        self.lock().pop_front()
    }

    /// Drop every undispatched item. Their waiters observe `Discarded`.
    pub(crate) fn clear(&self) -> usize {
        let drained: Vec<QueuedItem<P>> = self.lock().drain(..).collect();
        // Completions fire from Drop; keep that outside the lock.
        drained.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Drain `pending` into per-context executors until `stop` is raised.
///
/// Each wake drains everything queued so far, in submission order. Items
/// still queued when the loop stops stay queued for the next start.
///
/// Routing runs the payload factory for new keys. A panicking factory costs
/// only the item being routed (it resolves as `Discarded`); the loop keeps
/// draining.
pub(crate) async fn run_dispatch_loop<P: Send + 'static>(
    pending: Arc<PendingQueue<P>>,
    registry: Arc<ContextRegistry<P>>,
    stop: CancelSignal,
) {
    tracing::info!("Binding dispatch loop started");
    loop {
        let notified = pending.work_available.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if stop.is_cancelled() {
            break;
        }

        let mut dispatched = 0_usize;
        while let Some(item) = pending.pop() {
            let key = item.key().clone();
            let id = item.id();
            match panic::catch_unwind(AssertUnwindSafe(|| registry.dispatch(item))) {
                Ok(()) => dispatched += 1,
                Err(panic) => tracing::error!(
                    key = %key,
                    item = %id,
                    "Routing binding item panicked; item discarded: {}",
                    panic_payload_to_string(panic.as_ref())
                ),
            }
        }
        if dispatched > 0 {
            tracing::debug!(dispatched, "Dispatched pending binding items");
        }

        tokio::select! {
            () = &mut notified => {}
            () = stop.cancelled() => break,
        }
    }
    tracing::info!("Binding dispatch loop stopped");
}
