use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::{env_bool, env_parse, env_string, ConfigError};

/// Session lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Maximum session inactivity in seconds. The window slides on
    /// `lastAccessedAt`: any read or update restarts it.
    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,

    /// Forward clock-skew tolerance when judging inactivity. A peer pod
    /// with a slightly fast clock must not expire a fresh session.
    #[serde(default = "default_clock_skew_tolerance")]
    pub clock_skew_tolerance_secs: u64,

    /// Scan and validate all stored sessions at startup. Off by default in
    /// Redis mode, where sessions materialize lazily on first access.
    #[serde(default)]
    pub preload: bool,

    /// Apply the storage-level TTL to session keys in Redis. Disabling this
    /// leaves expiry purely to the manager's inactivity check.
    #[serde(default = "default_true")]
    pub redis_ttl_enabled: bool,

    /// Periodically snapshot all known session envelopes to disk, and
    /// restore from the snapshot when the primary store comes up empty.
    #[serde(default)]
    pub snapshot_enabled: bool,

    /// Snapshot file location.
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,

    /// Cap on AI-provider rotation keys a single config may carry.
    #[serde(default = "default_max_api_keys")]
    pub max_api_keys: usize,

    /// In-memory envelope LRU capacity (per pod).
    #[serde(default = "default_memory_cache_entries")]
    pub memory_cache_entries: usize,

    /// Decrypted-config LRU capacity (per pod).
    #[serde(default = "default_config_cache_entries")]
    pub config_cache_entries: usize,

    /// Decrypted-config cache TTL in seconds.
    #[serde(default = "default_config_cache_ttl")]
    pub config_cache_ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_age_secs: default_max_age(),
            clock_skew_tolerance_secs: default_clock_skew_tolerance(),
            preload: false,
            redis_ttl_enabled: true,
            snapshot_enabled: false,
            snapshot_path: default_snapshot_path(),
            max_api_keys: default_max_api_keys(),
            memory_cache_entries: default_memory_cache_entries(),
            config_cache_entries: default_config_cache_entries(),
            config_cache_ttl_secs: default_config_cache_ttl(),
        }
    }
}

impl SessionConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(preload) = env_bool("SESSION_PRELOAD")? {
            config.preload = preload;
        }
        if let Some(enabled) = env_bool("SESSION_REDIS_TTL_ENABLED")? {
            config.redis_ttl_enabled = enabled;
        }
        if let Some(enabled) = env_bool("SESSION_SNAPSHOT_ENABLED")? {
            config.snapshot_enabled = enabled;
        }
        if let Some(path) = env_string("SESSION_SNAPSHOT_PATH") {
            config.snapshot_path = PathBuf::from(path);
        }
        if let Some(max_keys) = env_parse::<usize>("MAX_API_KEYS")? {
            config.max_api_keys = max_keys;
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_api_keys == 0 {
            return Err(ConfigError::Validation(
                "MAX_API_KEYS must be at least 1".into(),
            ));
        }
        if self.max_age_secs == 0 {
            return Err(ConfigError::Validation(
                "Session max_age_secs must be greater than 0".into(),
            ));
        }
        if self.memory_cache_entries == 0 || self.config_cache_entries == 0 {
            return Err(ConfigError::Validation(
                "Session cache capacities must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

fn default_max_age() -> u64 {
    90 * 24 * 60 * 60 // 90 days of inactivity
}

fn default_clock_skew_tolerance() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from("./data/sessions-snapshot.json")
}

fn default_max_api_keys() -> usize {
    5
}

fn default_memory_cache_entries() -> usize {
    1_000
}

fn default_config_cache_entries() -> usize {
    500
}

fn default_config_cache_ttl() -> u64 {
    300 // 5 minutes
}
