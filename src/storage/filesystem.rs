//! Local filesystem backend.
//!
//! Layout under the per-tenant base directory:
//!
//! ```text
//! <base>/<cacheType>/<shard>/<key>        content
//! <base>/<cacheType>/<shard>/<key>.meta   metadata sidecar (JSON)
//! <base>/<cacheType>/lru.json             key -> last-access mirror
//! <base>/<cacheType>/size                 total-bytes counter
//! ```
//!
//! Shards are the first two hex characters of the key's SHA-256, keeping
//! directories small under large caches. All writes go through a temp file
//! and rename, so a crash never leaves a half-written entry. On startup the
//! LRU mirror and size counter are checked against the shard directories and
//! rebuilt by scan when they diverge.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::config::FilesystemStorageConfig;

use super::{
    error::{StorageError, StorageResult},
    key_matches_pattern,
    keys::sanitize_key,
    policy::{CachePolicy, EVICTION_BATCH},
    CacheType, CleanupReport, EntryMetadata, StorageAdapter,
};

const META_SUFFIX: &str = ".meta";
const LRU_FILE: &str = "lru.json";
const SIZE_FILE: &str = "size";

/// In-memory bookkeeping for one cache type, mirrored to disk.
#[derive(Default)]
struct TypeState {
    /// key -> last-access timestamp (millis). Strictly monotonic so
    /// same-millisecond writes keep a stable eviction order.
    lru: HashMap<String, i64>,
    size: u64,
    last_stamp: i64,
}

impl TypeState {
    fn next_stamp(&mut self) -> i64 {
        let now = Utc::now().timestamp_millis();
        self.last_stamp = now.max(self.last_stamp + 1);
        self.last_stamp
    }

    /// Oldest keys first, at most `limit`.
    fn oldest_keys(&self, limit: usize) -> Vec<String> {
        let mut entries: Vec<(&String, i64)> = self.lru.iter().map(|(k, ts)| (k, *ts)).collect();
        entries.sort_by_key(|(_, ts)| *ts);
        entries
            .into_iter()
            .take(limit)
            .map(|(k, _)| k.clone())
            .collect()
    }
}

pub struct FilesystemBackend {
    base_dir: PathBuf,
    policy: CachePolicy,
    state: Mutex<HashMap<CacheType, TypeState>>,
}

impl FilesystemBackend {
    pub fn new(config: FilesystemStorageConfig, policy: CachePolicy) -> Self {
        Self {
            base_dir: config.base_dir,
            policy,
            state: Mutex::new(HashMap::new()),
        }
    }

    fn type_dir(&self, cache_type: CacheType) -> PathBuf {
        self.base_dir.join(cache_type.as_str())
    }

    /// Canonical on-disk key: sanitized, then made path-safe. The LRU index,
    /// the shard layout, and `list` all speak this form.
    fn disk_key(key: &str) -> StorageResult<String> {
        Ok(sanitize_key(key)?.replace(['/', '.'], "_"))
    }

    fn shard_for(disk_key: &str) -> String {
        let digest = hex::encode(Sha256::digest(disk_key.as_bytes()));
        digest[..2].to_string()
    }

    fn content_path(&self, cache_type: CacheType, disk_key: &str) -> PathBuf {
        self.type_dir(cache_type)
            .join(Self::shard_for(disk_key))
            .join(disk_key)
    }

    fn meta_path(&self, cache_type: CacheType, disk_key: &str) -> PathBuf {
        let mut path = self.content_path(cache_type, disk_key).into_os_string();
        path.push(META_SUFFIX);
        PathBuf::from(path)
    }

    async fn write_atomic(path: &Path, bytes: &[u8]) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let suffix: u32 = rand::thread_rng().gen();
        let tmp = path.with_extension(format!("tmp{suffix:08x}"));
        tokio::fs::write(&tmp, bytes).await?;
        match tokio::fs::rename(&tmp, path).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                Err(e.into())
            }
        }
    }

    async fn read_meta_file(path: &Path) -> Option<EntryMetadata> {
        let bytes = tokio::fs::read(path).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Load or rebuild the bookkeeping for a cache type. Called with the
    /// state lock held, on first touch of the type.
    async fn ensure_loaded<'a>(
        &self,
        state: &'a mut HashMap<CacheType, TypeState>,
        cache_type: CacheType,
    ) -> StorageResult<&'a mut TypeState> {
        if !state.contains_key(&cache_type) {
            let dir = self.type_dir(cache_type);
            tokio::fs::create_dir_all(&dir).await?;

            let mut loaded = TypeState::default();
            if let Ok(bytes) = tokio::fs::read(dir.join(LRU_FILE)).await {
                loaded.lru = serde_json::from_slice(&bytes).unwrap_or_default();
            }
            if let Ok(bytes) = tokio::fs::read(dir.join(SIZE_FILE)).await {
                loaded.size = String::from_utf8_lossy(&bytes).trim().parse().unwrap_or(0);
            }
            loaded.last_stamp = loaded.lru.values().copied().max().unwrap_or(0);

            let (scanned_keys, scanned_size) = self.scan_type(cache_type).await?;
            let diverged = scanned_size != loaded.size
                || scanned_keys.len() != loaded.lru.len()
                || scanned_keys.keys().any(|k| !loaded.lru.contains_key(k));
            if diverged {
                tracing::info!(
                    cache_type = %cache_type,
                    indexed = loaded.lru.len(),
                    on_disk = scanned_keys.len(),
                    "Cache index diverged from disk; rebuilding by scan"
                );
                let stamp = loaded.last_stamp;
                loaded.lru = scanned_keys
                    .keys()
                    .map(|k| (k.clone(), loaded.lru.get(k).copied().unwrap_or(stamp)))
                    .collect();
                loaded.size = scanned_size;
                self.persist_index_inner(cache_type, &loaded).await?;
            }

            state.insert(cache_type, loaded);
        }
        state
            .get_mut(&cache_type)
            .ok_or_else(|| StorageError::Internal("cache state missing after load".into()))
    }

    /// Walk the shard directories: file-name -> content size, plus the sum.
    async fn scan_type(&self, cache_type: CacheType) -> StorageResult<(HashMap<String, u64>, u64)> {
        let dir = self.type_dir(cache_type);
        let mut keys = HashMap::new();
        let mut total = 0u64;

        let mut shards = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(_) => return Ok((keys, 0)),
        };
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = tokio::fs::read_dir(shard.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.ends_with(META_SUFFIX) || name.contains(".tmp") {
                    continue;
                }
                let len = entry.metadata().await?.len();
                total += len;
                keys.insert(name, len);
            }
        }
        Ok((keys, total))
    }

    async fn persist_index_inner(
        &self,
        cache_type: CacheType,
        state: &TypeState,
    ) -> StorageResult<()> {
        let dir = self.type_dir(cache_type);
        let lru_bytes = serde_json::to_vec(&state.lru)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        Self::write_atomic(&dir.join(LRU_FILE), &lru_bytes).await?;
        Self::write_atomic(&dir.join(SIZE_FILE), state.size.to_string().as_bytes()).await?;
        Ok(())
    }

    /// Remove one entry's files and its LRU slot. Size accounting is the
    /// caller's responsibility. Called with the state lock held.
    async fn remove_entry(&self, cache_type: CacheType, state: &mut TypeState, key: &str) {
        let content = self.content_path(cache_type, key);
        let meta = self.meta_path(cache_type, key);
        let _ = tokio::fs::remove_file(&content).await;
        let _ = tokio::fs::remove_file(&meta).await;
        state.lru.remove(key);
    }

    /// Evict oldest entries until at least `need` bytes are freed or the
    /// index is empty. Called with the state lock held.
    async fn evict(
        &self,
        cache_type: CacheType,
        state: &mut TypeState,
        mut need: u64,
        skip: &str,
    ) -> StorageResult<CleanupReport> {
        let mut report = CleanupReport::default();

        while need > 0 && !state.lru.is_empty() {
            let batch = state.oldest_keys(EVICTION_BATCH);
            let mut progressed = false;
            for key in batch {
                // Never evict the key being written.
                if key == skip {
                    continue;
                }
                let freed = self.entry_size(cache_type, &key).await.unwrap_or(0);
                self.remove_entry(cache_type, state, &key).await;
                state.size = state.size.saturating_sub(freed);
                report.deleted += 1;
                report.bytes_freed += freed;
                need = need.saturating_sub(freed);
                progressed = true;
                if need == 0 {
                    break;
                }
            }
            if !progressed {
                break;
            }
        }

        if report.deleted > 0 {
            tracing::debug!(
                cache_type = %cache_type,
                deleted = report.deleted,
                bytes_freed = report.bytes_freed,
                "Evicted oldest entries to satisfy size cap"
            );
        }
        Ok(report)
    }

    async fn entry_size(&self, cache_type: CacheType, key: &str) -> Option<u64> {
        if let Some(meta) = Self::read_meta_file(&self.meta_path(cache_type, key)).await {
            return Some(meta.size);
        }
        tokio::fs::metadata(self.content_path(cache_type, key))
            .await
            .ok()
            .map(|m| m.len())
    }
}

#[async_trait]
impl StorageAdapter for FilesystemBackend {
    async fn initialize(&self) -> StorageResult<()> {
        tokio::fs::create_dir_all(&self.base_dir).await?;
        let mut state = self.state.lock().await;
        for cache_type in CacheType::ALL {
            self.ensure_loaded(&mut state, cache_type).await?;
        }
        Ok(())
    }

    async fn get(&self, key: &str, cache_type: CacheType) -> StorageResult<Option<Vec<u8>>> {
        let key = Self::disk_key(key)?;
        let mut state = self.state.lock().await;
        let ts = self.ensure_loaded(&mut state, cache_type).await?;

        let meta_path = self.meta_path(cache_type, &key);
        let Some(meta) = Self::read_meta_file(&meta_path).await else {
            return Ok(None);
        };
        if meta.is_expired() {
            self.remove_entry(cache_type, ts, &key).await;
            ts.size = ts.size.saturating_sub(meta.size);
            self.persist_index_inner(cache_type, ts).await?;
            return Ok(None);
        }

        let content = match tokio::fs::read(self.content_path(cache_type, &key)).await {
            Ok(bytes) => bytes,
            // Orphaned sidecar; the next cleanup reconciles it.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let stamp = ts.next_stamp();
        ts.lru.insert(key, stamp);
        self.persist_index_inner(cache_type, ts).await?;
        Ok(Some(content))
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        cache_type: CacheType,
        ttl: Option<Duration>,
    ) -> StorageResult<()> {
        let key = Self::disk_key(key)?;
        let new_size = value.len() as u64;
        let ttl = self.policy.effective_ttl(cache_type, ttl);

        let mut state = self.state.lock().await;
        let ts = self.ensure_loaded(&mut state, cache_type).await?;

        let meta_path = self.meta_path(cache_type, &key);
        let existing = Self::read_meta_file(&meta_path).await;
        let old_size = existing.as_ref().map(|m| m.size).unwrap_or(0);

        let need = self
            .policy
            .bytes_to_free(cache_type, ts.size.saturating_sub(old_size), new_size);
        if need > 0 {
            self.evict(cache_type, ts, need, &key).await?;
        }

        let now = Utc::now();
        let meta = EntryMetadata {
            size: new_size,
            created_at: existing.map(|m| m.created_at).unwrap_or(now),
            expires_at: ttl.map(|d| now + chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())),
        };
        let meta_bytes =
            serde_json::to_vec(&meta).map_err(|e| StorageError::Serialization(e.to_string()))?;

        Self::write_atomic(&self.content_path(cache_type, &key), value).await?;
        Self::write_atomic(&meta_path, &meta_bytes).await?;

        let stamp = ts.next_stamp();
        ts.lru.insert(key, stamp);
        ts.size = ts.size.saturating_sub(old_size) + new_size;
        self.persist_index_inner(cache_type, ts).await?;
        Ok(())
    }

    async fn delete(&self, key: &str, cache_type: CacheType) -> StorageResult<bool> {
        let key = Self::disk_key(key)?;
        let mut state = self.state.lock().await;
        let ts = self.ensure_loaded(&mut state, cache_type).await?;

        let existed = ts.lru.contains_key(&key)
            || tokio::fs::metadata(self.content_path(cache_type, &key))
                .await
                .is_ok();
        if !existed {
            return Ok(false);
        }

        let freed = self.entry_size(cache_type, &key).await.unwrap_or(0);
        self.remove_entry(cache_type, ts, &key).await;
        ts.size = ts.size.saturating_sub(freed);
        self.persist_index_inner(cache_type, ts).await?;
        Ok(true)
    }

    async fn exists(&self, key: &str, cache_type: CacheType) -> StorageResult<bool> {
        let key = Self::disk_key(key)?;
        match Self::read_meta_file(&self.meta_path(cache_type, &key)).await {
            Some(meta) => Ok(!meta.is_expired()),
            None => Ok(tokio::fs::metadata(self.content_path(cache_type, &key))
                .await
                .is_ok()),
        }
    }

    async fn list(&self, cache_type: CacheType, pattern: &str) -> StorageResult<Vec<String>> {
        let mut state = self.state.lock().await;
        let ts = self.ensure_loaded(&mut state, cache_type).await?;
        let mut keys: Vec<String> = ts
            .lru
            .keys()
            .filter(|k| key_matches_pattern(k, pattern))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn size(&self, cache_type: CacheType) -> StorageResult<u64> {
        let mut state = self.state.lock().await;
        let ts = self.ensure_loaded(&mut state, cache_type).await?;
        Ok(ts.size)
    }

    async fn metadata(
        &self,
        key: &str,
        cache_type: CacheType,
    ) -> StorageResult<Option<EntryMetadata>> {
        let key = Self::disk_key(key)?;
        match Self::read_meta_file(&self.meta_path(cache_type, &key)).await {
            Some(meta) if meta.is_expired() => Ok(None),
            other => Ok(other),
        }
    }

    async fn cleanup(&self, cache_type: CacheType) -> StorageResult<CleanupReport> {
        let mut state = self.state.lock().await;
        let ts = self.ensure_loaded(&mut state, cache_type).await?;
        let mut report = CleanupReport::default();

        let (on_disk, _) = self.scan_type(cache_type).await?;

        // Orphan sweep: content without a sidecar and expired entries go.
        let mut removed: std::collections::HashSet<String> = std::collections::HashSet::new();
        for key in on_disk.keys() {
            let meta_path = self.meta_path(cache_type, key);
            let meta = Self::read_meta_file(&meta_path).await;
            let drop_entry = match &meta {
                None => true,
                Some(m) => m.is_expired(),
            };
            if drop_entry {
                let freed = meta
                    .map(|m| m.size)
                    .or_else(|| on_disk.get(key).copied())
                    .unwrap_or(0);
                self.remove_entry(cache_type, ts, key).await;
                ts.size = ts.size.saturating_sub(freed);
                removed.insert(key.clone());
                report.deleted += 1;
                report.bytes_freed += freed;
            }
        }

        // Sidecars whose content vanished.
        let dir = self.type_dir(cache_type);
        if let Ok(mut shards) = tokio::fs::read_dir(&dir).await {
            while let Some(shard) = shards.next_entry().await? {
                if !shard.file_type().await?.is_dir() {
                    continue;
                }
                let mut entries = tokio::fs::read_dir(shard.path()).await?;
                while let Some(entry) = entries.next_entry().await? {
                    let name = entry.file_name().to_string_lossy().to_string();
                    if let Some(content_name) = name.strip_suffix(META_SUFFIX) {
                        if !on_disk.contains_key(content_name) {
                            let _ = tokio::fs::remove_file(entry.path()).await;
                            report.deleted += 1;
                        }
                    }
                }
            }
        }
        // Index entries with no surviving file.
        ts.lru
            .retain(|k, _| on_disk.contains_key(k) && !removed.contains(k));

        // Re-enforce the size cap.
        let limit = self.policy.size_limit(cache_type);
        if ts.size > limit {
            let need = ts.size - self.policy.eviction_target(cache_type);
            let evicted = self.evict(cache_type, ts, need, "").await?;
            report.deleted += evicted.deleted;
            report.bytes_freed += evicted.bytes_freed;
        }

        self.persist_index_inner(cache_type, ts).await?;
        Ok(report)
    }

    async fn health_check(&self) -> bool {
        let probe = self.base_dir.join(".health");
        if tokio::fs::create_dir_all(&self.base_dir).await.is_err() {
            return false;
        }
        match tokio::fs::write(&probe, b"ok").await {
            Ok(()) => {
                let _ = tokio::fs::remove_file(&probe).await;
                true
            }
            Err(_) => false,
        }
    }

    async fn close(&self) -> StorageResult<()> {
        let state = self.state.lock().await;
        for (cache_type, ts) in state.iter() {
            self.persist_index_inner(*cache_type, ts).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheLimitsConfig;

    fn backend_with_cap(dir: &Path, cap: u64) -> FilesystemBackend {
        let policy = CachePolicy::new(CacheLimitsConfig {
            subtitle_bytes: cap,
            subtitle_ttl_secs: None,
            ..Default::default()
        });
        FilesystemBackend::new(
            FilesystemStorageConfig {
                base_dir: dir.to_path_buf(),
            },
            policy,
        )
    }

    #[tokio::test]
    async fn set_get_roundtrip_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend_with_cap(dir.path(), 1_000_000);
        backend.initialize().await.unwrap();

        backend
            .set("tt0111161:eng", b"WEBVTT payload", CacheType::Subtitle, None)
            .await
            .unwrap();

        let value = backend
            .get("tt0111161:eng", CacheType::Subtitle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value, b"WEBVTT payload");

        let meta = backend
            .metadata("tt0111161:eng", CacheType::Subtitle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(meta.size, 14);
        assert!(meta.expires_at.is_none());
        assert!(backend.exists("tt0111161:eng", CacheType::Subtitle).await.unwrap());
    }

    #[tokio::test]
    async fn update_preserves_created_at_and_size_counter() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend_with_cap(dir.path(), 1_000_000);

        backend
            .set("k1", b"0123456789", CacheType::Subtitle, None)
            .await
            .unwrap();
        let created = backend
            .metadata("k1", CacheType::Subtitle)
            .await
            .unwrap()
            .unwrap()
            .created_at;

        backend
            .set("k1", b"01234", CacheType::Subtitle, None)
            .await
            .unwrap();
        let meta = backend
            .metadata("k1", CacheType::Subtitle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(meta.created_at, created);
        assert_eq!(meta.size, 5);
        assert_eq!(backend.size(CacheType::Subtitle).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn size_counter_tracks_surviving_entries() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend_with_cap(dir.path(), 1_000_000);

        for i in 0..4 {
            backend
                .set(&format!("k{i}"), &[0u8; 100], CacheType::Subtitle, None)
                .await
                .unwrap();
        }
        assert_eq!(backend.size(CacheType::Subtitle).await.unwrap(), 400);

        assert!(backend.delete("k0", CacheType::Subtitle).await.unwrap());
        assert!(!backend.delete("k0", CacheType::Subtitle).await.unwrap());
        assert_eq!(backend.size(CacheType::Subtitle).await.unwrap(), 300);
    }

    #[tokio::test]
    async fn eviction_brings_total_under_target() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend_with_cap(dir.path(), 1_000);

        for i in 0..10 {
            backend
                .set(&format!("k{i}"), &[0u8; 200], CacheType::Subtitle, None)
                .await
                .unwrap();
        }

        // Cap 1000, target 800: the counter never exceeds the target after
        // an eviction round, and the oldest keys are the ones that went.
        let total = backend.size(CacheType::Subtitle).await.unwrap();
        assert!(total <= 800, "size {total} exceeds eviction target");
        assert!(backend
            .get("k0", CacheType::Subtitle)
            .await
            .unwrap()
            .is_none());
        assert!(backend
            .get("k9", CacheType::Subtitle)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn recently_read_entries_survive_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend_with_cap(dir.path(), 1_000);

        for i in 0..4 {
            backend
                .set(&format!("k{i}"), &[0u8; 200], CacheType::Subtitle, None)
                .await
                .unwrap();
        }
        // Touch k0 so k1 becomes the eviction candidate.
        backend.get("k0", CacheType::Subtitle).await.unwrap();

        backend
            .set("k4", &[0u8; 200], CacheType::Subtitle, None)
            .await
            .unwrap();

        assert!(backend.get("k0", CacheType::Subtitle).await.unwrap().is_some());
        assert!(backend.get("k1", CacheType::Subtitle).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_entries_read_as_misses() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend_with_cap(dir.path(), 1_000_000);

        backend
            .set(
                "ephemeral",
                b"x",
                CacheType::Subtitle,
                Some(Duration::from_millis(20)),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(backend
            .get("ephemeral", CacheType::Subtitle)
            .await
            .unwrap()
            .is_none());
        assert_eq!(backend.size(CacheType::Subtitle).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cleanup_removes_orphan_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend_with_cap(dir.path(), 1_000_000);

        backend
            .set("kept", b"data", CacheType::Subtitle, None)
            .await
            .unwrap();

        // Fabricate an orphaned sidecar with no content file.
        let orphan_meta = backend.meta_path(CacheType::Subtitle, "ghost");
        FilesystemBackend::write_atomic(
            &orphan_meta,
            br#"{"size":4,"createdAt":"2024-01-01T00:00:00Z"}"#,
        )
        .await
        .unwrap();

        let report = backend.cleanup(CacheType::Subtitle).await.unwrap();
        assert!(report.deleted >= 1);
        assert!(tokio::fs::metadata(&orphan_meta).await.is_err());
        assert!(backend.get("kept", CacheType::Subtitle).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn index_rebuilds_after_divergence() {
        let dir = tempfile::tempdir().unwrap();
        {
            let backend = backend_with_cap(dir.path(), 1_000_000);
            backend
                .set("survivor", b"abcdef", CacheType::Subtitle, None)
                .await
                .unwrap();
            backend.close().await.unwrap();
        }

        // Corrupt the size counter on disk; a fresh backend must rebuild.
        let size_file = dir.path().join("subtitle").join(SIZE_FILE);
        tokio::fs::write(&size_file, b"999999").await.unwrap();

        let backend = backend_with_cap(dir.path(), 1_000_000);
        assert_eq!(backend.size(CacheType::Subtitle).await.unwrap(), 6);
        assert!(backend
            .get("survivor", CacheType::Subtitle)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn hostile_keys_do_not_alias() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend_with_cap(dir.path(), 1_000_000);

        backend
            .set("abc", b"clean", CacheType::Subtitle, None)
            .await
            .unwrap();
        backend
            .set("ab*", b"hostile", CacheType::Subtitle, None)
            .await
            .unwrap();

        assert_eq!(
            backend.get("abc", CacheType::Subtitle).await.unwrap().unwrap(),
            b"clean"
        );
        assert_eq!(
            backend.get("ab*", CacheType::Subtitle).await.unwrap().unwrap(),
            b"hostile"
        );
    }
}
