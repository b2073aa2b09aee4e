//! Resolved queue settings.
//!
//! The raw TOML/JSON shape (millisecond integers, every field optional) stays
//! private. It is validated into [`QueueSettings`] at the deserialization
//! boundary, so holding a `QueueSettings` proves the values are usable.

use serde::Deserialize;
use std::time::Duration;

const DEFAULT_TIMEOUT_MS: u64 = 500;
const DEFAULT_LOCK_WAIT_TIMEOUT_MS: u64 = 0;
const DEFAULT_LATE_COMPLETION_GRACE_MS: u64 = 5_000;
const DEFAULT_STOP_TIMEOUT_MS: u64 = 2_000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("default_timeout_ms must be greater than zero")]
    ZeroDefaultTimeout,
    #[error("late_completion_grace_ms must be greater than zero")]
    ZeroLateCompletionGrace,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawQueueSettings {
    #[serde(default = "default_timeout_ms")]
    default_timeout_ms: u64,
    #[serde(default)]
    lock_wait_timeout_ms: u64,
    #[serde(default = "default_late_completion_grace_ms")]
    late_completion_grace_ms: u64,
    #[serde(default = "default_stop_timeout_ms")]
    stop_timeout_ms: u64,
}

const fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

const fn default_late_completion_grace_ms() -> u64 {
    DEFAULT_LATE_COMPLETION_GRACE_MS
}

const fn default_stop_timeout_ms() -> u64 {
    DEFAULT_STOP_TIMEOUT_MS
}

/// Validated timing policy for a binding queue.
///
/// Invariant: `default_timeout` and `late_completion_grace` are non-zero
/// (enforced via `#[serde(try_from)]` and [`QueueSettings::new`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawQueueSettings")]
pub struct QueueSettings {
    default_timeout: Duration,
    lock_wait_timeout: Duration,
    late_completion_grace: Duration,
    stop_timeout: Duration,
}

impl TryFrom<RawQueueSettings> for QueueSettings {
    type Error = SettingsError;

    fn try_from(raw: RawQueueSettings) -> Result<Self, Self::Error> {
        Self::new(
            Duration::from_millis(raw.default_timeout_ms),
            Duration::from_millis(raw.lock_wait_timeout_ms),
            Duration::from_millis(raw.late_completion_grace_ms),
            Duration::from_millis(raw.stop_timeout_ms),
        )
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            lock_wait_timeout: Duration::from_millis(DEFAULT_LOCK_WAIT_TIMEOUT_MS),
            late_completion_grace: Duration::from_millis(DEFAULT_LATE_COMPLETION_GRACE_MS),
            stop_timeout: Duration::from_millis(DEFAULT_STOP_TIMEOUT_MS),
        }
    }
}

impl QueueSettings {
    pub fn new(
        default_timeout: Duration,
        lock_wait_timeout: Duration,
        late_completion_grace: Duration,
        stop_timeout: Duration,
    ) -> Result<Self, SettingsError> {
        if default_timeout.is_zero() {
            return Err(SettingsError::ZeroDefaultTimeout);
        }
        if late_completion_grace.is_zero() {
            return Err(SettingsError::ZeroLateCompletionGrace);
        }
        Ok(Self {
            default_timeout,
            lock_wait_timeout,
            late_completion_grace,
            stop_timeout,
        })
    }

    /// Timeout a new context gets when an item does not carry its own.
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Gate budget for items that do not carry their own. Zero means a
    /// single try-acquire.
    #[must_use]
    pub fn lock_wait_timeout(&self) -> Duration {
        self.lock_wait_timeout
    }

    /// How long the supervisor keeps waiting for a timed-out operation to
    /// return before moving on to the next item of the same key.
    #[must_use]
    pub fn late_completion_grace(&self) -> Duration {
        self.late_completion_grace
    }

    #[must_use]
    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout
    }

    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        if !timeout.is_zero() {
            self.default_timeout = timeout;
        }
        self
    }

    #[must_use]
    pub fn with_lock_wait_timeout(mut self, timeout: Duration) -> Self {
        self.lock_wait_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_late_completion_grace(mut self, grace: Duration) -> Self {
        if !grace.is_zero() {
            self.late_completion_grace = grace;
        }
        self
    }
}
