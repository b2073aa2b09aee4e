//! Configuration loading for bindq.
//!
//! The config file is TOML, looked up at `$BINDQ_CONFIG` or
//! `~/.bindq/config.toml`. A missing file is not an error; callers fall back
//! to [`QueueSettings::default`].
//!
//! ```toml
//! [queue]
//! default_timeout_ms = 500
//! lock_wait_timeout_ms = 0
//! late_completion_grace_ms = 5000
//! stop_timeout_ms = 2000
//! ```

use std::path::{Path, PathBuf};

use bindq_types::QueueSettings;
use serde::Deserialize;

/// Environment variable that overrides the config file location.
pub const CONFIG_PATH_ENV: &str = "BINDQ_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BindqConfig {
    /// Binding queue timing policy.
    pub queue: Option<QueueSettings>,
}

impl BindqConfig {
    /// Load the config from the default location.
    ///
    /// Returns `Ok(None)` when no config path can be determined or the file
    /// does not exist.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let path = match config_path() {
            Some(path) => path,
            None => return Ok(None),
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from(&path).map(Some)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        match toml::from_str(&content) {
            Ok(config) => Ok(config),
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }

    /// Resolved queue settings; defaults when the `[queue]` table is absent.
    #[must_use]
    pub fn queue_settings(&self) -> QueueSettings {
        self.queue.unwrap_or_default()
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }
}

pub fn config_path() -> Option<PathBuf> {
    if let Some(explicit) = std::env::var_os(CONFIG_PATH_ENV)
        && !explicit.is_empty()
    {
        return Some(PathBuf::from(explicit));
    }
    dirs::home_dir().map(|home| home.join(".bindq").join("config.toml"))
}
