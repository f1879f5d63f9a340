//! Embedded track cache.
//!
//! Subtitle tracks extracted from video containers, split into `original`
//! and `translation` variants. Every mutation maintains a compact per-video
//! index (`index:<variant>:<hash>`) so the hot lookup path never scans
//! storage; the index is rebuilt by scan when missing. Index persistence
//! also deletes stray keys, keeping storage and index convergent.
//!
//! Originals are pruned by batch identity: extraction runs supply a numeric
//! `batchId` cohort, and only the most recent cohort survives. Tracks
//! without batch identity fall back to keeping the newest extraction
//! timestamp only.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::{CacheType, StorageAdapter, StorageExt, StorageResult};

/// Index entries kept per (variant, video).
const MAX_INDEX_ENTRIES: usize = 200;

const INDEX_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackVariant {
    Original,
    Translation,
}

impl TrackVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackVariant::Original => "original",
            TrackVariant::Translation => "translation",
        }
    }
}

/// One extracted subtitle track.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddedTrack {
    pub video_hash: String,
    pub track_id: String,
    pub language: String,

    /// Set on translated tracks; `None` marks an original extraction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_language: Option<String>,

    /// Extraction cohort. Pruning keeps only the most recent cohort.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<u64>,

    pub content: String,
    pub extracted_at: DateTime<Utc>,
}

impl EmbeddedTrack {
    pub fn variant(&self) -> TrackVariant {
        if self.target_language.is_some() {
            TrackVariant::Translation
        } else {
            TrackVariant::Original
        }
    }

    fn key(&self) -> String {
        match &self.target_language {
            Some(target) => format!(
                "{}:{}:{}:{}:{}",
                TrackVariant::Translation.as_str(),
                self.video_hash,
                self.track_id,
                self.language,
                target
            ),
            None => format!(
                "{}:{}:{}:{}",
                TrackVariant::Original.as_str(),
                self.video_hash,
                self.track_id,
                self.language
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoIndex {
    version: u32,
    entries: Vec<String>,
}

pub struct EmbeddedTrackStore {
    storage: Arc<dyn StorageAdapter>,
}

impl EmbeddedTrackStore {
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self { storage }
    }

    fn index_key(variant: TrackVariant, video_hash: &str) -> String {
        format!("index:{}:{}", variant.as_str(), video_hash)
    }

    fn video_prefix(variant: TrackVariant, video_hash: &str) -> String {
        format!("{}:{}:", variant.as_str(), video_hash)
    }

    /// Store a track and fold it into the per-video index.
    pub async fn save(&self, track: EmbeddedTrack) -> StorageResult<()> {
        let variant = track.variant();
        let key = track.key();
        let video_hash = track.video_hash.clone();

        self.storage
            .set_json(&key, &track, CacheType::Embedded, None)
            .await?;

        let mut entries = self.load_or_rebuild_index(variant, &video_hash).await?;
        entries.retain(|existing| *existing != key);
        entries.insert(0, key);
        entries.truncate(MAX_INDEX_ENTRIES);
        self.persist_index(variant, &video_hash, entries).await
    }

    pub async fn get_original(
        &self,
        video_hash: &str,
        track_id: &str,
        language: &str,
    ) -> StorageResult<Option<EmbeddedTrack>> {
        let key = format!(
            "{}:{video_hash}:{track_id}:{language}",
            TrackVariant::Original.as_str()
        );
        self.storage.get_json(&key, CacheType::Embedded).await
    }

    pub async fn get_translation(
        &self,
        video_hash: &str,
        track_id: &str,
        language: &str,
        target_language: &str,
    ) -> StorageResult<Option<EmbeddedTrack>> {
        let key = format!(
            "{}:{video_hash}:{track_id}:{language}:{target_language}",
            TrackVariant::Translation.as_str()
        );
        self.storage.get_json(&key, CacheType::Embedded).await
    }

    /// All live tracks of a variant for a video. Index entries whose track
    /// vanished are dropped from the index on the way through.
    pub async fn list_for_video(
        &self,
        variant: TrackVariant,
        video_hash: &str,
    ) -> StorageResult<Vec<EmbeddedTrack>> {
        let entries = self.load_or_rebuild_index(variant, video_hash).await?;

        let mut tracks = Vec::with_capacity(entries.len());
        let mut live = Vec::with_capacity(entries.len());
        for key in entries {
            match self
                .storage
                .get_json::<EmbeddedTrack>(&key, CacheType::Embedded)
                .await?
            {
                Some(track) => {
                    live.push(key);
                    tracks.push(track);
                }
                None => {}
            }
        }
        self.persist_index(variant, video_hash, live).await?;
        Ok(tracks)
    }

    /// Keep only the most recent extraction cohort of a video's originals:
    /// the highest `batchId` when any track carries one, otherwise the
    /// newest `extractedAt`. Returns the number of tracks pruned.
    pub async fn prune_originals(&self, video_hash: &str) -> StorageResult<usize> {
        let tracks = self
            .list_for_video(TrackVariant::Original, video_hash)
            .await?;
        if tracks.is_empty() {
            return Ok(0);
        }

        let keep: Vec<bool> = match tracks.iter().filter_map(|t| t.batch_id).max() {
            Some(latest_batch) => tracks
                .iter()
                .map(|t| t.batch_id == Some(latest_batch))
                .collect(),
            None => {
                let newest = tracks
                    .iter()
                    .map(|t| t.extracted_at)
                    .max()
                    .unwrap_or_else(Utc::now);
                tracks.iter().map(|t| t.extracted_at == newest).collect()
            }
        };

        let mut surviving = Vec::new();
        let mut pruned = 0usize;
        for (track, keep) in tracks.into_iter().zip(keep) {
            let key = track.key();
            if keep {
                surviving.push(key);
            } else {
                self.storage.delete(&key, CacheType::Embedded).await?;
                pruned += 1;
            }
        }

        self.persist_index(TrackVariant::Original, video_hash, surviving)
            .await?;
        if pruned > 0 {
            tracing::debug!(video = %video_hash, pruned, "Pruned stale original tracks");
        }
        Ok(pruned)
    }

    async fn load_or_rebuild_index(
        &self,
        variant: TrackVariant,
        video_hash: &str,
    ) -> StorageResult<Vec<String>> {
        let index = self
            .storage
            .get_json::<VideoIndex>(&Self::index_key(variant, video_hash), CacheType::Embedded)
            .await?
            .filter(|i| i.version == INDEX_VERSION);
        if let Some(index) = index {
            return Ok(index.entries);
        }

        // Miss: rebuild from a scan.
        let prefix = Self::video_prefix(variant, video_hash);
        let mut entries = self
            .storage
            .list(CacheType::Embedded, &format!("{prefix}*"))
            .await?;
        entries.truncate(MAX_INDEX_ENTRIES);
        Ok(entries)
    }

    /// Write the index, deleting stray keys so storage and index converge.
    async fn persist_index(
        &self,
        variant: TrackVariant,
        video_hash: &str,
        mut entries: Vec<String>,
    ) -> StorageResult<()> {
        entries.truncate(MAX_INDEX_ENTRIES);

        let prefix = Self::video_prefix(variant, video_hash);
        let on_disk = self
            .storage
            .list(CacheType::Embedded, &format!("{prefix}*"))
            .await?;
        for stray in on_disk {
            if !entries.contains(&stray) {
                self.storage.delete(&stray, CacheType::Embedded).await?;
                tracing::debug!(key = %stray, "Deleted stray embedded track");
            }
        }

        self.storage
            .set_json(
                &Self::index_key(variant, video_hash),
                &VideoIndex {
                    version: INDEX_VERSION,
                    entries,
                },
                CacheType::Embedded,
                None,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::FilesystemStorageConfig,
        storage::{CachePolicy, FilesystemBackend},
    };

    async fn store(dir: &std::path::Path) -> EmbeddedTrackStore {
        let storage: Arc<dyn StorageAdapter> = Arc::new(FilesystemBackend::new(
            FilesystemStorageConfig {
                base_dir: dir.to_path_buf(),
            },
            CachePolicy::new(Default::default()),
        ));
        storage.initialize().await.unwrap();
        EmbeddedTrackStore::new(storage)
    }

    fn original(hash: &str, track_id: &str, lang: &str, batch: Option<u64>) -> EmbeddedTrack {
        EmbeddedTrack {
            video_hash: hash.to_string(),
            track_id: track_id.to_string(),
            language: lang.to_string(),
            target_language: None,
            batch_id: batch,
            content: format!("track {track_id} ({lang})"),
            extracted_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn save_and_get_both_variants() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;

        store.save(original("vid", "2", "eng", None)).await.unwrap();
        store
            .save(EmbeddedTrack {
                target_language: Some("spa".into()),
                ..original("vid", "2", "eng", None)
            })
            .await
            .unwrap();

        let orig = store.get_original("vid", "2", "eng").await.unwrap().unwrap();
        assert!(orig.target_language.is_none());
        assert_eq!(orig.variant(), TrackVariant::Original);

        let translated = store
            .get_translation("vid", "2", "eng", "spa")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(translated.target_language.as_deref(), Some("spa"));
        assert!(store
            .get_translation("vid", "2", "eng", "fre")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn listing_is_scoped_by_variant_and_video() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;

        store.save(original("vid-a", "1", "eng", None)).await.unwrap();
        store.save(original("vid-a", "2", "ger", None)).await.unwrap();
        store.save(original("vid-b", "1", "eng", None)).await.unwrap();
        store
            .save(EmbeddedTrack {
                target_language: Some("spa".into()),
                ..original("vid-a", "1", "eng", None)
            })
            .await
            .unwrap();

        let originals = store
            .list_for_video(TrackVariant::Original, "vid-a")
            .await
            .unwrap();
        assert_eq!(originals.len(), 2);

        let translations = store
            .list_for_video(TrackVariant::Translation, "vid-a")
            .await
            .unwrap();
        assert_eq!(translations.len(), 1);
    }

    #[tokio::test]
    async fn index_rebuilds_after_loss() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;

        store.save(original("vid", "1", "eng", None)).await.unwrap();
        store.save(original("vid", "2", "ger", None)).await.unwrap();

        store
            .storage
            .delete(
                &EmbeddedTrackStore::index_key(TrackVariant::Original, "vid"),
                CacheType::Embedded,
            )
            .await
            .unwrap();

        let tracks = store
            .list_for_video(TrackVariant::Original, "vid")
            .await
            .unwrap();
        assert_eq!(tracks.len(), 2);
    }

    #[tokio::test]
    async fn pruning_keeps_only_latest_batch() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;

        store.save(original("vid", "1", "eng", Some(1))).await.unwrap();
        store.save(original("vid", "2", "ger", Some(1))).await.unwrap();
        store.save(original("vid", "3", "eng", Some(2))).await.unwrap();

        let pruned = store.prune_originals("vid").await.unwrap();
        assert_eq!(pruned, 2);

        let survivors = store
            .list_for_video(TrackVariant::Original, "vid")
            .await
            .unwrap();
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].track_id, "3");
        assert!(store.get_original("vid", "1", "eng").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pruning_without_batches_keeps_newest_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;

        let mut old = original("vid", "1", "eng", None);
        old.extracted_at = Utc::now() - chrono::Duration::hours(2);
        store.save(old).await.unwrap();
        store.save(original("vid", "2", "ger", None)).await.unwrap();

        let pruned = store.prune_originals("vid").await.unwrap();
        assert_eq!(pruned, 1);

        let survivors = store
            .list_for_video(TrackVariant::Original, "vid")
            .await
            .unwrap();
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].track_id, "2");
    }

    #[tokio::test]
    async fn stray_keys_are_deleted_during_index_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;

        store.save(original("vid", "1", "eng", None)).await.unwrap();

        // A key written behind the index's back.
        let stray = original("vid", "9", "fre", None);
        store
            .storage
            .set_json(&stray.key(), &stray, CacheType::Embedded, None)
            .await
            .unwrap();

        // Saving another track persists the index and sweeps the stray...
        store.save(original("vid", "2", "ger", None)).await.unwrap();

        assert!(store.get_original("vid", "9", "fre").await.unwrap().is_none());
    }
}
