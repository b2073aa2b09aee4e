//! Fault classification and the collaborator hooks a queue owner supplies.

use std::io;

use bindq_types::ContextKey;

/// Marker error for callers that detect a dead connection themselves.
///
/// Returning it (or wrapping it with `anyhow::Context`) from an operation
/// makes the default classifier treat the fault as connection-fatal.
#[derive(Debug, Clone, thiserror::Error)]
#[error("connection lost: {reason}")]
pub struct ConnectionLost {
    reason: String,
}

impl ConnectionLost {
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

fn is_transport_io_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
            | io::ErrorKind::UnexpectedEof
    )
}

/// Default connection-fatal classifier.
///
/// Walks the whole error chain, so context wrapped around a transport error
/// does not hide it.
#[must_use]
pub fn is_transport_fault(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause.is::<ConnectionLost>()
            || cause
                .downcast_ref::<io::Error>()
                .is_some_and(|io_err| is_transport_io_kind(io_err.kind()))
    })
}

/// Collaborators consumed by the queue.
///
/// Payload teardown is the payload's own `Drop`: an evicted context releases
/// its payload once the last in-flight operation holding it has returned.
pub trait ContextHooks<P>: Send + Sync + 'static {
    /// Build the payload for a context created on first reference to `key`.
    ///
    /// Called with the registry lock held; keep it cheap (open connections
    /// lazily from inside operations or after [`crate::BindingQueue::add_context`]).
    /// It must not call back into the queue or its registry (`context`,
    /// `is_context_connected`, `add_context`, ...): the registry lock is not
    /// reentrant, so such a call deadlocks.
    fn create_payload(&self, key: &ContextKey) -> P;

    /// Whether `err` invalidates the whole context rather than one operation.
    fn is_connection_fatal(&self, err: &anyhow::Error) -> bool {
        is_transport_fault(err)
    }

    /// Sink for fatal faults. Fired once per fatal fault, after the context
    /// has been evicted.
    fn on_connection_fatal(&self, key: &ContextKey, err: &anyhow::Error) {
        let _ = (key, err);
    }
}

impl<P, F> ContextHooks<P> for F
where
    F: Fn(&ContextKey) -> P + Send + Sync + 'static,
{
    fn create_payload(&self, key: &ContextKey) -> P {
        self(key)
    }
}
