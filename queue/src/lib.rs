//! Keyed binding queue.
//!
//! Serializes and time-bounds bind operations per connection key so that
//! non-thread-safe per-connection metadata is only ever touched by one
//! operation at a time, while distinct keys proceed in parallel.
//!
//! ```text
//! submit ─► pending ─► dispatch loop ─► registry (get or create context)
//!                                              │
//!                                              ▼
//!                     per-context serial executor ─► timeout supervisor ─► handle
//! ```

pub mod cancel;
pub mod fault;

mod context;
mod dispatch;
mod error;
mod executor;
mod item;
mod queue;
mod registry;

pub use bindq_types::{ContextKey, DEFAULT_CONTEXT_KEY, QueueSettings};
pub use cancel::CancelSignal;
pub use context::BindingContext;
pub use error::QueueError;
pub use fault::{ConnectionLost, ContextHooks, is_transport_fault};
pub use item::{BindingHandle, BindingOutcome, ItemId, Resolution};
pub use queue::{BindingQueue, Submission};
pub use registry::ContextRegistry;
