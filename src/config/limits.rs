use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::storage::CacheType;

/// Per-cache-type size caps and default TTLs.
///
/// Caps are in bytes of serialized content. When a write would push a cache
/// type past its cap, the backend evicts oldest entries until the total is
/// at or below the eviction target (80% of the cap).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheLimitsConfig {
    #[serde(default = "default_session_bytes")]
    pub session_bytes: u64,

    #[serde(default = "default_subtitle_bytes")]
    pub subtitle_bytes: u64,

    #[serde(default = "default_translation_bytes")]
    pub translation_bytes: u64,

    #[serde(default = "default_embedded_bytes")]
    pub embedded_bytes: u64,

    #[serde(default = "default_smdb_bytes")]
    pub smdb_bytes: u64,

    /// Default TTL for subtitle artifacts, in seconds.
    #[serde(default = "default_subtitle_ttl")]
    pub subtitle_ttl_secs: Option<u64>,

    /// Default TTL for embedded tracks, in seconds.
    #[serde(default = "default_embedded_ttl")]
    pub embedded_ttl_secs: Option<u64>,
}

impl Default for CacheLimitsConfig {
    fn default() -> Self {
        Self {
            session_bytes: default_session_bytes(),
            subtitle_bytes: default_subtitle_bytes(),
            translation_bytes: default_translation_bytes(),
            embedded_bytes: default_embedded_bytes(),
            smdb_bytes: default_smdb_bytes(),
            subtitle_ttl_secs: default_subtitle_ttl(),
            embedded_ttl_secs: default_embedded_ttl(),
        }
    }
}

impl CacheLimitsConfig {
    /// Size cap in bytes for a cache type.
    pub fn size_limit(&self, cache_type: CacheType) -> u64 {
        match cache_type {
            CacheType::Session => self.session_bytes,
            CacheType::Subtitle => self.subtitle_bytes,
            CacheType::Translation => self.translation_bytes,
            CacheType::Embedded => self.embedded_bytes,
            CacheType::Smdb => self.smdb_bytes,
        }
    }

    /// Default TTL for a cache type. `None` means entries never expire
    /// unless the caller supplies a TTL.
    pub fn default_ttl(&self, cache_type: CacheType) -> Option<Duration> {
        let secs = match cache_type {
            CacheType::Session => None,
            CacheType::Subtitle => self.subtitle_ttl_secs,
            CacheType::Translation => None,
            CacheType::Embedded => self.embedded_ttl_secs,
            CacheType::Smdb => None,
        };
        secs.map(Duration::from_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for cache_type in CacheType::ALL {
            if self.size_limit(cache_type) == 0 {
                return Err(ConfigError::Validation(format!(
                    "Size cap for cache type '{}' must be greater than 0",
                    cache_type.as_str()
                )));
            }
        }
        Ok(())
    }
}

fn default_session_bytes() -> u64 {
    256 * 1024 * 1024
}

fn default_subtitle_bytes() -> u64 {
    1024 * 1024 * 1024
}

fn default_translation_bytes() -> u64 {
    512 * 1024 * 1024
}

fn default_embedded_bytes() -> u64 {
    512 * 1024 * 1024
}

fn default_smdb_bytes() -> u64 {
    256 * 1024 * 1024
}

fn default_subtitle_ttl() -> Option<u64> {
    Some(30 * 24 * 60 * 60)
}

fn default_embedded_ttl() -> Option<u64> {
    Some(30 * 24 * 60 * 60)
}
