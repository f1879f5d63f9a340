use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::{env_bool, env_parse, env_string, ConfigError};

/// Key prefix applied when the operator does not configure one.
/// Prefix self-healing defaults to on only when this fallback is in use.
pub const DEFAULT_KEY_PREFIX: &str = "submaker:";

/// Legacy prefixes that earlier deployments wrote keys under. The Redis
/// backend migrates keys from these variants to the configured prefix.
pub const LEGACY_KEY_PREFIXES: &[&str] = &["submaker", "stremio-submaker:"];

/// Storage backend configuration.
///
/// The backend holds every cache type: session envelopes, subtitle artifacts,
/// translation memory, embedded tracks, and the community subtitle index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum StorageConfig {
    /// Local filesystem storage. Good for single-node deployments.
    Filesystem(FilesystemStorageConfig),

    /// Redis storage. Required for multi-node deployments; supports
    /// Sentinel-managed failover.
    Redis(RedisStorageConfig),
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Filesystem(FilesystemStorageConfig::default())
    }
}

impl StorageConfig {
    /// Build from `STORAGE_TYPE` and the `REDIS_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        match env_string("STORAGE_TYPE").as_deref() {
            Some("redis") => Ok(StorageConfig::Redis(RedisStorageConfig::from_env()?)),
            Some("filesystem") | None => Ok(StorageConfig::Filesystem(
                FilesystemStorageConfig::default(),
            )),
            Some(other) => Err(ConfigError::InvalidEnvVar(
                "STORAGE_TYPE".into(),
                other.to_string(),
            )),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            StorageConfig::Filesystem(c) => c.validate(),
            StorageConfig::Redis(c) => c.validate(),
        }
    }
}

/// Filesystem backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilesystemStorageConfig {
    /// Base directory for all cache types. Each cache type gets a
    /// subdirectory with sharded content below it.
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
}

impl Default for FilesystemStorageConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
        }
    }
}

impl FilesystemStorageConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.base_dir.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "Filesystem storage base_dir cannot be empty".into(),
            ));
        }
        Ok(())
    }
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("./cache")
}

/// Redis backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisStorageConfig {
    /// Redis host (standalone mode).
    #[serde(default = "default_redis_host")]
    pub host: String,

    /// Redis port (standalone mode).
    #[serde(default = "default_redis_port")]
    pub port: u16,

    /// Optional AUTH password.
    #[serde(default)]
    pub password: Option<String>,

    /// Logical database index.
    #[serde(default)]
    pub db: i64,

    /// Tenant key prefix. Applied once, at the client layer; application
    /// code never prepends it.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Additional prefix variants to migrate keys from during
    /// initialization (operator-provided, comma-separated in the env).
    #[serde(default)]
    pub prefix_variants: Vec<String>,

    /// Explicit prefix-migration toggle. When unset, migration runs only if
    /// the fallback prefix is in use.
    #[serde(default)]
    pub prefix_migration: Option<bool>,

    /// Sentinel failover configuration. When present, `host`/`port` are
    /// ignored and the master is resolved through the sentinels.
    #[serde(default)]
    pub sentinel: Option<SentinelConfig>,

    /// Initial connection timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Per-command retry attempts.
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// First retry delay in milliseconds; doubles each attempt.
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,

    /// Upper bound on the retry delay in milliseconds.
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,
}

impl Default for RedisStorageConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            password: None,
            db: 0,
            key_prefix: default_key_prefix(),
            prefix_variants: Vec::new(),
            prefix_migration: None,
            sentinel: None,
            connect_timeout_secs: default_connect_timeout(),
            retries: default_retries(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
        }
    }
}

impl RedisStorageConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(host) = env_string("REDIS_HOST") {
            config.host = host;
        }
        if let Some(port) = env_parse::<u16>("REDIS_PORT")? {
            config.port = port;
        }
        config.password = env_string("REDIS_PASSWORD");
        if let Some(db) = env_parse::<i64>("REDIS_DB")? {
            config.db = db;
        }
        if let Some(prefix) = env_string("REDIS_KEY_PREFIX") {
            config.key_prefix = prefix;
        }
        if let Some(variants) = env_string("REDIS_KEY_PREFIX_VARIANTS") {
            config.prefix_variants = variants
                .split(',')
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .collect();
        }
        config.prefix_migration = env_bool("REDIS_PREFIX_MIGRATION")?;

        if env_bool("REDIS_SENTINEL_ENABLED")?.unwrap_or(false) {
            config.sentinel = Some(SentinelConfig::from_env()?);
        }

        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::Validation("Redis host cannot be empty".into()));
        }
        if self.key_prefix.is_empty() {
            return Err(ConfigError::Validation(
                "Redis key_prefix cannot be empty".into(),
            ));
        }
        if let Some(sentinel) = &self.sentinel {
            sentinel.validate()?;
        }
        Ok(())
    }

    /// Whether the initialization prefix-migration sweep should run.
    pub fn migration_enabled(&self) -> bool {
        self.prefix_migration
            .unwrap_or(self.key_prefix == DEFAULT_KEY_PREFIX)
    }

    /// Connection URL for a standalone deployment.
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }

    /// Every prefix the migration sweep considers: operator variants,
    /// colon/no-colon spellings of the active prefix, and legacy defaults.
    pub fn all_prefix_variants(&self) -> Vec<String> {
        let mut variants: Vec<String> = Vec::new();
        let mut push = |candidate: String| {
            if candidate != self.key_prefix && !candidate.is_empty() && !variants.contains(&candidate)
            {
                variants.push(candidate);
            }
        };

        for variant in &self.prefix_variants {
            push(variant.clone());
        }
        match self.key_prefix.strip_suffix(':') {
            Some(bare) => push(bare.to_string()),
            None => push(format!("{}:", self.key_prefix)),
        }
        for legacy in LEGACY_KEY_PREFIXES {
            push((*legacy).to_string());
        }

        variants
    }
}

/// Sentinel-managed failover configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SentinelConfig {
    /// Sentinel nodes as `host:port` pairs.
    pub nodes: Vec<String>,

    /// Monitored master name.
    #[serde(default = "default_sentinel_name")]
    pub master_name: String,
}

impl SentinelConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let nodes = env_string("REDIS_SENTINELS")
            .map(|raw| {
                raw.split(',')
                    .map(|n| n.trim().to_string())
                    .filter(|n| !n.is_empty())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        Ok(Self {
            nodes,
            master_name: env_string("REDIS_SENTINEL_NAME").unwrap_or_else(default_sentinel_name),
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.nodes.is_empty() {
            return Err(ConfigError::Validation(
                "REDIS_SENTINEL_ENABLED is set but REDIS_SENTINELS lists no nodes".into(),
            ));
        }
        Ok(())
    }
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_sentinel_name() -> String {
    "mymaster".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_retries() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    50
}

fn default_retry_max_delay() -> u64 {
    2_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_variants_include_colon_spelling_and_legacy() {
        let config = RedisStorageConfig {
            key_prefix: "tenant-a:".to_string(),
            prefix_variants: vec!["old-tenant:".to_string()],
            ..Default::default()
        };
        let variants = config.all_prefix_variants();
        assert!(variants.contains(&"old-tenant:".to_string()));
        assert!(variants.contains(&"tenant-a".to_string()));
        assert!(variants.contains(&"submaker".to_string()));
        assert!(!variants.contains(&"tenant-a:".to_string()));
    }

    #[test]
    fn migration_defaults_follow_prefix() {
        let fallback = RedisStorageConfig::default();
        assert!(fallback.migration_enabled());

        let tenant = RedisStorageConfig {
            key_prefix: "tenant-a:".to_string(),
            ..Default::default()
        };
        assert!(!tenant.migration_enabled());

        let opted_in = RedisStorageConfig {
            key_prefix: "tenant-a:".to_string(),
            prefix_migration: Some(true),
            ..Default::default()
        };
        assert!(opted_in.migration_enabled());
    }

    #[test]
    #[serial_test::serial]
    fn sentinel_from_env() {
        temp_env::with_vars(
            [
                ("REDIS_SENTINEL_ENABLED", Some("true")),
                ("REDIS_SENTINELS", Some("10.0.0.1:26379, 10.0.0.2:26379")),
                ("REDIS_SENTINEL_NAME", Some("submaster")),
            ],
            || {
                let config = RedisStorageConfig::from_env().unwrap();
                let sentinel = config.sentinel.unwrap();
                assert_eq!(sentinel.nodes.len(), 2);
                assert_eq!(sentinel.master_name, "submaster");
            },
        );
    }
}
