//! Configuration for the session and cache core.
//!
//! The core is configured entirely through environment variables so it can be
//! dropped into container deployments without a config file. Every section
//! has serde-backed defaults, which keeps programmatic construction (tests,
//! embedding crates) ergonomic.
//!
//! # Example
//!
//! ```ignore
//! std::env::set_var("STORAGE_TYPE", "redis");
//! std::env::set_var("REDIS_HOST", "cache.internal");
//! let config = CoreConfig::from_env()?;
//! ```

mod encryption;
mod limits;
mod observability;
mod session;
mod storage;

pub use encryption::*;
pub use limits::*;
pub use observability::*;
use serde::{Deserialize, Serialize};
pub use session::*;
pub use storage::*;

/// Root configuration for the session and cache core.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct CoreConfig {
    /// Storage backend selection and connection parameters.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Encryption key acquisition for secrets at rest.
    #[serde(default)]
    pub encryption: EncryptionConfig,

    /// Session lifecycle: TTL, preload, snapshot, rotation caps.
    #[serde(default)]
    pub session: SessionConfig,

    /// Per-cache-type size caps and default TTLs.
    #[serde(default)]
    pub limits: CacheLimitsConfig,

    /// Logging setup.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl CoreConfig {
    /// Build the configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            storage: StorageConfig::from_env()?,
            encryption: EncryptionConfig::from_env()?,
            session: SessionConfig::from_env()?,
            limits: CacheLimitsConfig::default(),
            logging: LoggingConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for consistency and completeness.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.storage.validate()?;
        self.encryption.validate()?;
        self.session.validate()?;
        self.limits.validate()?;
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidEnvVar(String, String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Read an optional environment variable, treating empty strings as unset.
pub(crate) fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Read and parse an optional environment variable.
pub(crate) fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match env_string(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnvVar(name.to_string(), raw)),
        None => Ok(None),
    }
}

/// Read a boolean environment variable. Accepts true/false, 1/0, yes/no.
pub(crate) fn env_bool(name: &str) -> Result<Option<bool>, ConfigError> {
    match env_string(name) {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Some(true)),
            "false" | "0" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidEnvVar(name.to_string(), raw)),
        },
        None => Ok(None),
    }
}
