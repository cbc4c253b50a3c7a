//! Server configuration.
//!
//! Values come from three layers, later ones winning:
//!
//! 1. built-in defaults,
//! 2. an optional TOML file,
//! 3. [`Overrides`] — in the `kiri` binary these are the command-line flags,
//!    which themselves fall back to the `KIRI_BIND`, `KIRI_STATIC_DIR` and
//!    `KIRI_AUTH_SECRET` environment variables.
//!
//! ```toml
//! bind = "127.0.0.1:8000"
//! static_dir = "./dist"
//! auth_secret = "secret123"
//! sse_interval_ms = 2000
//! log_filter = "kiri=debug,info"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Settings for the `kiri` server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Listen address, e.g. `0.0.0.0:8000`.
    pub bind: String,

    /// Directory the built front end is served from.
    pub static_dir: PathBuf,

    /// Shared bearer secret for `/api` routes. `None` disables the check.
    pub auth_secret: Option<String>,

    /// Period of the counter driver behind `/api/sse`.
    pub sse_interval_ms: u64,

    /// Default `tracing` filter when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
            static_dir: PathBuf::from("./dist"),
            auth_secret: None,
            sse_interval_ms: 2000,
            log_filter: "info".to_string(),
        }
    }
}

/// Values that replace whatever the file or defaults provided.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub bind: Option<String>,
    pub static_dir: Option<PathBuf>,
    pub auth_secret: Option<String>,
}

impl ServerConfig {
    /// Loads the file at `path`, or the defaults when `path` is `None`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] if the file cannot be read, [`ConfigError::Toml`]
    /// if it is malformed, [`ConfigError::Invalid`] if a value is out of
    /// range.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(content)?;
        config.auth_secret = config.auth_secret.filter(|secret| !secret.is_empty());
        config.validate()?;
        Ok(config)
    }

    /// Applies `overrides` and re-validates.
    pub fn with_overrides(mut self, overrides: Overrides) -> Result<Self, ConfigError> {
        if let Some(bind) = overrides.bind {
            self.bind = bind;
        }
        if let Some(static_dir) = overrides.static_dir {
            self.static_dir = static_dir;
        }
        if let Some(secret) = overrides.auth_secret {
            self.auth_secret = Some(secret).filter(|secret| !secret.is_empty());
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind.trim().is_empty() {
            return Err(ConfigError::Invalid("bind must not be empty".into()));
        }
        if self.sse_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "sse_interval_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn sse_interval(&self) -> Duration {
        Duration::from_millis(self.sse_interval_ms)
    }
}
