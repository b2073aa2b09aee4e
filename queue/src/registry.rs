//! Key → context map.
//!
//! The registry owns each live context together with the sender of its
//! serial executor. Removing an entry is the state transition for eviction:
//! dropping the sender lets the executor drain what it already received and
//! exit, while new submissions for the key get a fresh context.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bindq_types::{ContextKey, QueueSettings};
use tokio::sync::mpsc;

use crate::context::BindingContext;
use crate::executor::{self, ExecutionEnv};
use crate::fault::ContextHooks;
use crate::item::QueuedItem;

struct ContextEntry<P> {
    context: Arc<BindingContext<P>>,
    /// Spawned on first dispatch, so contexts registered outside a runtime
    /// (e.g. `add_context` during setup) never need one.
    executor: Option<mpsc::UnboundedSender<QueuedItem<P>>>,
}

/// Registry of binding contexts, guarded by its own mutex.
///
/// The registry lock is never held while waiting on a context's gate, so
/// adding or evicting contexts never blocks behind an in-flight operation.
pub struct ContextRegistry<P> {
    contexts: Mutex<HashMap<ContextKey, ContextEntry<P>>>,
    hooks: Arc<dyn ContextHooks<P>>,
    settings: QueueSettings,
}

impl<P: Send + 'static> ContextRegistry<P> {
    pub fn new(settings: QueueSettings, hooks: impl ContextHooks<P>) -> Self {
        Self {
            contexts: Mutex::new(HashMap::new()),
            hooks: Arc::new(hooks),
            settings,
        }
    }

    #[must_use]
    pub fn settings(&self) -> QueueSettings {
        self.settings
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ContextKey, ContextEntry<P>>> {
        self.contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn entry_for<'a>(
        &self,
        contexts: &'a mut HashMap<ContextKey, ContextEntry<P>>,
        key: &ContextKey,
    ) -> &'a mut ContextEntry<P> {
        contexts.entry(key.clone()).or_insert_with(|| {
            tracing::debug!(key = %key, "Creating binding context");
            let payload = self.hooks.create_payload(key);
            ContextEntry {
                context: Arc::new(BindingContext::new(
                    key.clone(),
                    payload,
                    self.settings.default_timeout(),
                )),
                executor: None,
            }
        })
    }

    /// Existing context for `key`, or a newly created one.
    pub fn get_or_create(&self, key: impl Into<ContextKey>) -> Arc<BindingContext<P>> {
        let key = key.into();
        let mut contexts = self.lock();
        Arc::clone(&self.entry_for(&mut contexts, &key).context)
    }

    #[must_use]
    pub fn get(&self, key: impl Into<ContextKey>) -> Option<Arc<BindingContext<P>>> {
        let key = key.into();
        self.lock().get(&key).map(|entry| Arc::clone(&entry.context))
    }

    #[must_use]
    pub fn exists(&self, key: impl Into<ContextKey>) -> bool {
        let key = key.into();
        self.lock().contains_key(&key)
    }

    /// Evict the context for `key`. The returned context is marked evicted
    /// and disconnected: an in-flight operation finishes, items still queued
    /// behind it are discarded, and the payload drops once nothing holds it.
    pub fn remove(&self, key: impl Into<ContextKey>) -> Option<Arc<BindingContext<P>>> {
        let key = key.into();
        let entry = self.lock().remove(&key)?;
        entry.context.mark_evicted();
        tracing::debug!(key = %key, "Removed binding context");
        Some(entry.context)
    }

    /// Evict `context` only if it is still the registered instance for its
    /// key. A stale fault must not evict a context recreated meanwhile.
    pub(crate) fn remove_if_current(&self, context: &Arc<BindingContext<P>>) -> bool {
        let mut contexts = self.lock();
        let is_current = contexts
            .get(context.key())
            .is_some_and(|entry| Arc::ptr_eq(&entry.context, context));
        if is_current {
            contexts.remove(context.key());
        }
        drop(contexts);
        context.mark_evicted();
        is_current
    }

    #[must_use]
    pub fn keys(&self) -> Vec<ContextKey> {
        let mut keys: Vec<ContextKey> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub(crate) fn execution_env(self: &Arc<Self>) -> ExecutionEnv<P> {
        ExecutionEnv::new(
            Arc::downgrade(self),
            Arc::clone(&self.hooks),
            self.settings,
        )
    }

    /// Hand `item` to its context's serial executor, creating the context
    /// and spawning the executor on first use.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn dispatch(self: &Arc<Self>, item: QueuedItem<P>) {
        let key = item.key().clone();
        let id = item.id();
        let mut contexts = self.lock();
        let entry = self.entry_for(&mut contexts, &key);

        let sender = entry.executor.get_or_insert_with(|| {
            executor::spawn_serial_executor(Arc::clone(&entry.context), self.execution_env())
        });
        let Err(mpsc::error::SendError(item)) = sender.send(item) else {
            tracing::trace!(key = %key, item = %id, "Dispatched binding item");
            return;
        };

        // The executor task is gone (runtime shutting down). Respawn once; if
        // that also fails the item is dropped and its waiter sees Discarded.
        tracing::warn!(key = %key, item = %id, "Serial executor closed; respawning");
        let sender =
            executor::spawn_serial_executor(Arc::clone(&entry.context), self.execution_env());
        if sender.send(item).is_err() {
            tracing::warn!(key = %key, item = %id, "Dropping binding item: executor unavailable");
        }
        entry.executor = Some(sender);
    }
}
