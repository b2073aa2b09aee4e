//! Per-key binding context: payload, gate, default timeout, connected and
//! evicted flags.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use bindq_types::ContextKey;
use tokio::sync::{MutexGuard, OwnedMutexGuard};

/// State shared by every operation bound to one key.
///
/// The payload lives behind the context's gate, an async mutex. Holding the
/// gate is the only way to reach the payload, so "at most one operation per
/// context" and "payload is only mutated under the gate" are the same rule.
pub struct BindingContext<P> {
    key: ContextKey,
    gate: Arc<tokio::sync::Mutex<P>>,
    default_timeout: Mutex<Duration>,
    connected: AtomicBool,
    evicted: AtomicBool,
    created_at: Instant,
}

impl<P> fmt::Debug for BindingContext<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingContext")
            .field("key", &self.key)
            .field("default_timeout", &self.default_timeout())
            .field("connected", &self.is_connected())
            .field("evicted", &self.is_evicted())
            .finish_non_exhaustive()
    }
}

impl<P> BindingContext<P> {
    pub(crate) fn new(key: ContextKey, payload: P, default_timeout: Duration) -> Self {
        Self {
            key,
            gate: Arc::new(tokio::sync::Mutex::new(payload)),
            default_timeout: Mutex::new(default_timeout),
            connected: AtomicBool::new(false),
            evicted: AtomicBool::new(false),
            created_at: Instant::now(),
        }
    }

    #[must_use]
    pub fn key(&self) -> &ContextKey {
        &self.key
    }

    /// Timeout applied to items that do not carry their own.
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        *self
            .default_timeout
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Zero is ignored: a context must always have a usable budget.
    pub fn set_default_timeout(&self, timeout: Duration) {
        if timeout.is_zero() {
            return;
        }
        *self
            .default_timeout
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = timeout;
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    /// Whether the registry has let go of this context. Items already routed
    /// to an evicted context never run; they resolve as `Discarded`.
    #[must_use]
    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    /// Sticky. Also clears the connected flag.
    pub(crate) fn mark_evicted(&self) {
        self.evicted.store(true, Ordering::Release);
        self.set_connected(false);
    }

    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Whether an operation (or the owner) currently holds the gate.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.gate.try_lock().is_err()
    }

    /// Take the gate without going through the queue.
    ///
    /// Meant for the owning service (e.g. wiring a fresh connection into the
    /// payload). Queued operations for this key wait, within their lock
    /// budget, until the guard is dropped.
    pub async fn payload(&self) -> MutexGuard<'_, P> {
        self.gate.lock().await
    }

    /// Take the gate only if it is open right now.
    #[must_use]
    pub fn try_payload(&self) -> Option<MutexGuard<'_, P>> {
        self.gate.try_lock().ok()
    }

    /// Acquire the gate within `budget`. A zero budget is a single try.
    pub(crate) async fn acquire(&self, budget: Duration) -> Option<OwnedMutexGuard<P>> {
        if budget.is_zero() {
            return Arc::clone(&self.gate).try_lock_owned().ok();
        }
        tokio::time::timeout(budget, Arc::clone(&self.gate).lock_owned())
            .await
            .ok()
    }
}
