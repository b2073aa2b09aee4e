use std::borrow::Borrow;
use std::fmt;

/// Key that blank submissions resolve to.
///
/// Operations queued before a connection exists (or for a disconnected editor
/// buffer) all share this one context.
pub const DEFAULT_CONTEXT_KEY: &str = "disconnected_binding_context";

/// Normalized context key.
///
/// Blank and whitespace-only input maps to [`DEFAULT_CONTEXT_KEY`]; anything
/// else is kept verbatim, so `"a"` and `" a"` are distinct keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ContextKey(String);

impl ContextKey {
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        if raw.trim().is_empty() {
            Self(DEFAULT_CONTEXT_KEY.to_string())
        } else {
            Self(raw)
        }
    }

    /// The reserved key used for blank input.
    #[must_use]
    pub fn default_key() -> Self {
        Self(DEFAULT_CONTEXT_KEY.to_string())
    }

    #[must_use]
    pub fn is_default(&self) -> bool {
        self.0 == DEFAULT_CONTEXT_KEY
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ContextKey {
    fn default() -> Self {
        Self::default_key()
    }
}

impl From<String> for ContextKey {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for ContextKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<&String> for ContextKey {
    fn from(value: &String) -> Self {
        Self::new(value.as_str())
    }
}

impl From<ContextKey> for String {
    fn from(value: ContextKey) -> Self {
        value.0
    }
}

impl AsRef<str> for ContextKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for ContextKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
