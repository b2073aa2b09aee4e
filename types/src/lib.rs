//! Core domain types for bindq.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! The queue crate and the config loader both depend on it.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory

mod key;
mod settings;

pub use key::{ContextKey, DEFAULT_CONTEXT_KEY};
pub use settings::{QueueSettings, SettingsError};
