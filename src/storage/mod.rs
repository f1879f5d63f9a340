//! Uniform key/value storage over two backends.
//!
//! The [`StorageAdapter`] trait is the only persistence contract the rest of
//! the addon sees. Two implementations exist: [`FilesystemBackend`] (sharded
//! directories with metadata sidecars) and [`RedisBackend`] (prefixed keys,
//! pipelined writes, sorted-set LRU). Both enforce key hygiene, per-type
//! size caps with LRU eviction, and TTL semantics.

mod error;
mod filesystem;
mod keys;
mod policy;
mod redis_backend;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
pub use error::{StorageError, StorageResult};
pub use filesystem::FilesystemBackend;
pub use keys::{sanitize_key, MAX_KEY_BYTES};
pub use policy::{CachePolicy, EVICTION_BATCH};
pub use redis_backend::RedisBackend;
use serde::{Deserialize, Serialize};

use crate::config::{CoreConfig, StorageConfig};

/// Namespace partitioning the data classes sharing a backend. Each type has
/// its own size cap, TTL policy, LRU index, and size counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheType {
    /// Session envelopes (token → encrypted user config).
    Session,
    /// Fetched and translated subtitle artifacts.
    Subtitle,
    /// Translation memory.
    Translation,
    /// Tracks extracted from video containers.
    Embedded,
    /// Community subtitle index.
    Smdb,
}

impl CacheType {
    pub const ALL: [CacheType; 5] = [
        CacheType::Session,
        CacheType::Subtitle,
        CacheType::Translation,
        CacheType::Embedded,
        CacheType::Smdb,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheType::Session => "session",
            CacheType::Subtitle => "subtitle",
            CacheType::Translation => "translation",
            CacheType::Embedded => "embedded",
            CacheType::Smdb => "smdb",
        }
    }
}

impl std::fmt::Display for CacheType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-entry metadata, stored alongside the content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryMetadata {
    /// Bytes of serialized content.
    pub size: u64,

    /// Preserved across updates to the same key.
    pub created_at: DateTime<Utc>,

    /// Absolute expiry; `None` means no expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl EntryMetadata {
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| Utc::now() >= exp)
    }
}

/// Outcome of an orphan sweep and cap re-enforcement pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: u64,
    pub bytes_freed: u64,
}

/// Uniform asynchronous key/value contract over both backends.
///
/// Keys are sanitized by the backend; callers pass raw keys. All operations
/// may suspend on I/O and are safe to call concurrently.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Prepare the backend: create directories or connect clients, rebuild
    /// diverged indexes, run prefix self-healing.
    async fn initialize(&self) -> StorageResult<()>;

    /// Fetch an entry. Bumps the LRU timestamp on hit. Expired entries are
    /// removed and reported as misses.
    async fn get(&self, key: &str, cache_type: CacheType) -> StorageResult<Option<Vec<u8>>>;

    /// Write an entry with its metadata, LRU position, and size delta.
    /// Updates preserve `createdAt` and reset the TTL window. A write that
    /// would breach the size cap evicts oldest entries first.
    async fn set(
        &self,
        key: &str,
        value: &[u8],
        cache_type: CacheType,
        ttl: Option<Duration>,
    ) -> StorageResult<()>;

    /// Remove an entry and its bookkeeping. Returns whether it existed.
    async fn delete(&self, key: &str, cache_type: CacheType) -> StorageResult<bool>;

    async fn exists(&self, key: &str, cache_type: CacheType) -> StorageResult<bool>;

    /// Enumerate raw keys of a cache type. `pattern` supports `*` (all) and
    /// `prefix*`. Metadata sidecars are excluded.
    async fn list(&self, cache_type: CacheType, pattern: &str) -> StorageResult<Vec<String>>;

    /// Total bytes stored for a cache type, from the transactional counter.
    async fn size(&self, cache_type: CacheType) -> StorageResult<u64>;

    async fn metadata(
        &self,
        key: &str,
        cache_type: CacheType,
    ) -> StorageResult<Option<EntryMetadata>>;

    /// Sweep orphans (content without metadata and vice versa), drop expired
    /// entries, and re-enforce the size cap.
    async fn cleanup(&self, cache_type: CacheType) -> StorageResult<CleanupReport>;

    async fn health_check(&self) -> bool;

    async fn close(&self) -> StorageResult<()>;

    /// Downcast to the Redis backend, when this is one. Used by the
    /// invalidation bus and the rotation counter, which need raw Redis.
    fn as_redis(&self) -> Option<&RedisBackend> {
        None
    }
}

/// JSON helpers over the byte-level contract.
#[async_trait]
pub trait StorageExt: StorageAdapter {
    async fn get_json<T: serde::de::DeserializeOwned + Send>(
        &self,
        key: &str,
        cache_type: CacheType,
    ) -> StorageResult<Option<T>> {
        match self.get(key, cache_type).await? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| StorageError::Deserialization(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn set_json<T: serde::Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        cache_type: CacheType,
        ttl: Option<Duration>,
    ) -> StorageResult<()> {
        let bytes =
            serde_json::to_vec(value).map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.set(key, &bytes, cache_type, ttl).await
    }
}

#[async_trait]
impl<S: StorageAdapter + ?Sized> StorageExt for S {}

/// Build the configured backend and initialize it.
pub async fn create_storage(config: &CoreConfig) -> StorageResult<Arc<dyn StorageAdapter>> {
    let policy = CachePolicy::new(config.limits.clone());

    let storage: Arc<dyn StorageAdapter> = match &config.storage {
        StorageConfig::Filesystem(fs_config) => {
            tracing::info!(base_dir = %fs_config.base_dir.display(), "Using filesystem storage");
            Arc::new(FilesystemBackend::new(fs_config.clone(), policy))
        }
        StorageConfig::Redis(redis_config) => {
            tracing::info!(
                host = %redis_config.host,
                sentinel = redis_config.sentinel.is_some(),
                "Using Redis storage"
            );
            Arc::new(RedisBackend::connect(redis_config.clone(), policy).await?)
        }
    };

    storage.initialize().await?;
    Ok(storage)
}

/// Match a raw key against the subset of glob patterns `list` supports.
pub(crate) fn key_matches_pattern(key: &str, pattern: &str) -> bool {
    match pattern {
        "*" | "" => true,
        p => match p.strip_suffix('*') {
            Some(prefix) => key.starts_with(prefix),
            None => key == p,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_matching_supports_prefix_globs() {
        assert!(key_matches_pattern("abc:eng", "*"));
        assert!(key_matches_pattern("abc:eng", "abc:*"));
        assert!(!key_matches_pattern("xyz:eng", "abc:*"));
        assert!(key_matches_pattern("exact", "exact"));
        assert!(!key_matches_pattern("exact2", "exact"));
    }

    #[test]
    fn metadata_expiry() {
        let live = EntryMetadata {
            size: 10,
            created_at: Utc::now(),
            expires_at: Some(Utc::now() + chrono::Duration::minutes(5)),
        };
        assert!(!live.is_expired());

        let dead = EntryMetadata {
            size: 10,
            created_at: Utc::now() - chrono::Duration::hours(2),
            expires_at: Some(Utc::now() - chrono::Duration::hours(1)),
        };
        assert!(dead.is_expired());
    }
}
