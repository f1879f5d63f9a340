//! Community subtitle index (SMDB).
//!
//! One subtitle artifact per `(videoHash, languageCode)` pair. Saving over
//! an existing pair is an *override* and is rate-limited per uploader so a
//! single account cannot churn the community copy. A compact per-video
//! language index avoids SCANs on the hot lookup path, and bidirectional
//! hash mappings let a subtitle stored under one video fingerprint be found
//! under another (player-reported vs. content-derived hashes).

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::storage::{CacheType, StorageAdapter, StorageExt, StorageResult};

/// Overrides allowed per uploader per window.
const OVERRIDE_LIMIT: usize = 3;
const OVERRIDE_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Language entries kept per video.
const MAX_LANGUAGES_PER_VIDEO: usize = 100;

/// Hash associations kept per side.
const MAX_HASH_MAPPINGS: usize = 10;

const INDEX_VERSION: u32 = 1;

/// A community subtitle artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmdbSubtitle {
    pub video_hash: String,
    pub language: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploader: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

/// Outcome of a save. A refused override is a structured result, not an
/// error: callers surface `remaining` to the uploader.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u32>,
    pub overridden: bool,
}

/// Per-video language index: `{version, entries: [...]}`, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LanguageIndex {
    version: u32,
    entries: Vec<LanguageEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LanguageEntry {
    language: String,
    updated_at: DateTime<Utc>,
}

pub struct SmdbStore {
    storage: Arc<dyn StorageAdapter>,
    /// uploader fingerprint -> override timestamps inside the window.
    /// Process-local: the limit is advisory churn protection, not billing.
    overrides: DashMap<String, Vec<i64>>,
}

impl SmdbStore {
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self {
            storage,
            overrides: DashMap::new(),
        }
    }

    fn entry_key(video_hash: &str, language: &str) -> String {
        format!("{video_hash}:{language}")
    }

    fn index_key(video_hash: &str) -> String {
        format!("index:{video_hash}")
    }

    fn mapping_key(video_hash: &str) -> String {
        format!("mapping:{video_hash}")
    }

    /// Store a subtitle for `(videoHash, language)`. First writes land
    /// unconditionally; writes over an existing entry are overrides and
    /// count against the uploader's hourly budget.
    pub async fn save(&self, subtitle: SmdbSubtitle) -> StorageResult<SaveOutcome> {
        let key = Self::entry_key(&subtitle.video_hash, &subtitle.language);
        let exists = self.storage.exists(&key, CacheType::Smdb).await?;

        if exists {
            let uploader_id = uploader_fingerprint(subtitle.uploader.as_deref());
            let remaining = self.consume_override(&uploader_id);
            let Some(remaining) = remaining else {
                tracing::debug!(
                    video = %subtitle.video_hash,
                    language = %subtitle.language,
                    "Override refused: hourly limit reached"
                );
                return Ok(SaveOutcome {
                    success: false,
                    error: Some(format!(
                        "Override limit reached: at most {OVERRIDE_LIMIT} overrides per hour"
                    )),
                    remaining: Some(0),
                    overridden: false,
                });
            };

            self.storage
                .set_json(&key, &subtitle, CacheType::Smdb, None)
                .await?;
            self.touch_language_index(&subtitle.video_hash, &subtitle.language)
                .await?;
            return Ok(SaveOutcome {
                success: true,
                error: None,
                remaining: Some(remaining),
                overridden: true,
            });
        }

        self.storage
            .set_json(&key, &subtitle, CacheType::Smdb, None)
            .await?;
        self.touch_language_index(&subtitle.video_hash, &subtitle.language)
            .await?;
        Ok(SaveOutcome {
            success: true,
            error: None,
            remaining: None,
            overridden: false,
        })
    }

    /// Fetch the subtitle for a single `(videoHash, language)` pair.
    pub async fn get(
        &self,
        video_hash: &str,
        language: &str,
    ) -> StorageResult<Option<SmdbSubtitle>> {
        self.storage
            .get_json(&Self::entry_key(video_hash, language), CacheType::Smdb)
            .await
    }

    /// Fetch across candidate hashes with first-hash-wins precedence: a
    /// player-reported hash ahead of a content-derived one in `hashes`
    /// takes priority.
    pub async fn get_multi(
        &self,
        hashes: &[String],
        language: &str,
    ) -> StorageResult<Option<SmdbSubtitle>> {
        for hash in hashes {
            if let Some(subtitle) = self.get(hash, language).await? {
                return Ok(Some(subtitle));
            }
        }
        Ok(None)
    }

    /// Languages available for a video, newest first. Served from the
    /// per-video index; rebuilt by scan when the index is missing.
    pub async fn list_languages(&self, video_hash: &str) -> StorageResult<Vec<String>> {
        if let Some(index) = self.load_index(video_hash).await? {
            return Ok(index.entries.into_iter().map(|e| e.language).collect());
        }
        let rebuilt = self.rebuild_index(video_hash).await?;
        Ok(rebuilt.entries.into_iter().map(|e| e.language).collect())
    }

    /// Union of languages across candidate hashes, first-hash-wins order
    /// preserved, duplicates dropped.
    pub async fn list_languages_multi(&self, hashes: &[String]) -> StorageResult<Vec<String>> {
        let mut merged = Vec::new();
        for hash in hashes {
            for language in self.list_languages(hash).await? {
                if !merged.contains(&language) {
                    merged.push(language);
                }
            }
        }
        Ok(merged)
    }

    /// Record both directions of a hash association so community subtitles
    /// found under one fingerprint are discoverable under the other.
    pub async fn save_hash_mapping(&self, hash1: &str, hash2: &str) -> StorageResult<()> {
        if hash1 == hash2 {
            return Ok(());
        }
        self.append_mapping(hash1, hash2).await?;
        self.append_mapping(hash2, hash1).await
    }

    /// Hashes associated with this one, most recent first.
    pub async fn hash_mappings(&self, video_hash: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .storage
            .get_json::<Vec<String>>(&Self::mapping_key(video_hash), CacheType::Smdb)
            .await?
            .unwrap_or_default())
    }

    async fn append_mapping(&self, from: &str, to: &str) -> StorageResult<()> {
        let key = Self::mapping_key(from);
        let mut mappings = self
            .storage
            .get_json::<Vec<String>>(&key, CacheType::Smdb)
            .await?
            .unwrap_or_default();

        mappings.retain(|existing| existing != to);
        mappings.insert(0, to.to_string());
        mappings.truncate(MAX_HASH_MAPPINGS);

        self.storage
            .set_json(&key, &mappings, CacheType::Smdb, None)
            .await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Language index maintenance
    // ─────────────────────────────────────────────────────────────────────

    async fn load_index(&self, video_hash: &str) -> StorageResult<Option<LanguageIndex>> {
        let index = self
            .storage
            .get_json::<LanguageIndex>(&Self::index_key(video_hash), CacheType::Smdb)
            .await?;
        Ok(index.filter(|i| i.version == INDEX_VERSION))
    }

    async fn touch_language_index(&self, video_hash: &str, language: &str) -> StorageResult<()> {
        let mut index = self
            .load_index(video_hash)
            .await?
            .unwrap_or(LanguageIndex {
                version: INDEX_VERSION,
                entries: Vec::new(),
            });

        // Deduplicate by language, newest wins, newest first.
        index.entries.retain(|entry| entry.language != language);
        index.entries.insert(
            0,
            LanguageEntry {
                language: language.to_string(),
                updated_at: Utc::now(),
            },
        );
        index.entries.truncate(MAX_LANGUAGES_PER_VIDEO);

        self.storage
            .set_json(
                &Self::index_key(video_hash),
                &index,
                CacheType::Smdb,
                None,
            )
            .await
    }

    /// Rebuild the index from a storage scan and persist it.
    async fn rebuild_index(&self, video_hash: &str) -> StorageResult<LanguageIndex> {
        let keys = self
            .storage
            .list(CacheType::Smdb, &format!("{video_hash}:*"))
            .await?;

        let prefix = format!("{video_hash}:");
        let now = Utc::now();
        let mut entries: Vec<LanguageEntry> = keys
            .iter()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter(|rest| !rest.is_empty() && !rest.contains(':'))
            .map(|language| LanguageEntry {
                language: language.to_string(),
                updated_at: now,
            })
            .collect();
        entries.truncate(MAX_LANGUAGES_PER_VIDEO);

        let index = LanguageIndex {
            version: INDEX_VERSION,
            entries,
        };
        self.storage
            .set_json(
                &Self::index_key(video_hash),
                &index,
                CacheType::Smdb,
                None,
            )
            .await?;
        tracing::debug!(video = %video_hash, languages = index.entries.len(), "Rebuilt language index");
        Ok(index)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Override rate limiting
    // ─────────────────────────────────────────────────────────────────────

    /// Consume one override slot. Returns the remaining budget, or `None`
    /// when the limit is already spent.
    fn consume_override(&self, uploader_id: &str) -> Option<u32> {
        let now = Utc::now().timestamp_millis();
        let window_start = now - OVERRIDE_WINDOW.as_millis() as i64;

        let mut slots = self.overrides.entry(uploader_id.to_string()).or_default();
        slots.retain(|stamp| *stamp > window_start);
        if slots.len() >= OVERRIDE_LIMIT {
            return None;
        }
        slots.push(now);
        Some((OVERRIDE_LIMIT - slots.len()) as u32)
    }

    /// Clear the override tracker. Exposed for tests.
    pub fn reset_override_tracker(&self) {
        self.overrides.clear();
    }
}

fn uploader_fingerprint(uploader: Option<&str>) -> String {
    let id = uploader.unwrap_or("anonymous");
    hex::encode(Sha256::digest(id.as_bytes()))[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::FilesystemStorageConfig,
        storage::{CachePolicy, FilesystemBackend},
    };

    async fn store(dir: &std::path::Path) -> SmdbStore {
        let storage: Arc<dyn StorageAdapter> = Arc::new(FilesystemBackend::new(
            FilesystemStorageConfig {
                base_dir: dir.to_path_buf(),
            },
            CachePolicy::new(Default::default()),
        ));
        storage.initialize().await.unwrap();
        SmdbStore::new(storage)
    }

    fn subtitle(hash: &str, lang: &str, uploader: &str) -> SmdbSubtitle {
        SmdbSubtitle {
            video_hash: hash.to_string(),
            language: lang.to_string(),
            content: format!("1\n00:00:01,000 --> 00:00:02,000\n{lang} line\n"),
            uploader: Some(uploader.to_string()),
            uploaded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn first_save_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;

        let outcome = store.save(subtitle("abc", "eng", "u1")).await.unwrap();
        assert!(outcome.success);
        assert!(!outcome.overridden);
        assert!(outcome.remaining.is_none());

        let found = store.get("abc", "eng").await.unwrap().unwrap();
        assert_eq!(found.language, "eng");
        assert!(store.get("abc", "spa").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fourth_override_in_an_hour_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;

        // Initial write, then overrides 1-3 succeed.
        store.save(subtitle("abc", "eng", "u1")).await.unwrap();
        for expected_remaining in [2u32, 1, 0] {
            let outcome = store.save(subtitle("abc", "eng", "u1")).await.unwrap();
            assert!(outcome.success);
            assert!(outcome.overridden);
            assert_eq!(outcome.remaining, Some(expected_remaining));
        }

        let refused = store.save(subtitle("abc", "eng", "u1")).await.unwrap();
        assert!(!refused.success);
        assert_eq!(refused.remaining, Some(0));
        assert!(refused.error.as_deref().unwrap().contains("limit reached"));

        // A different uploader still has budget.
        let other = store.save(subtitle("abc", "eng", "u2")).await.unwrap();
        assert!(other.success);

        // Resetting the tracker restores the exhausted uploader's budget.
        store.reset_override_tracker();
        let after_reset = store.save(subtitle("abc", "eng", "u1")).await.unwrap();
        assert!(after_reset.success);
        assert_eq!(after_reset.remaining, Some(2));
    }

    #[tokio::test]
    async fn multi_hash_lookup_is_first_hash_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;

        store.save(subtitle("player-hash", "eng", "u1")).await.unwrap();
        store.save(subtitle("content-hash", "eng", "u2")).await.unwrap();

        let hashes = vec!["player-hash".to_string(), "content-hash".to_string()];
        let found = store.get_multi(&hashes, "eng").await.unwrap().unwrap();
        assert_eq!(found.video_hash, "player-hash");

        // Fallback when the preferred hash has nothing.
        let found = store
            .get_multi(&hashes, "eng")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.uploader.as_deref(), Some("u1"));
        let only_second = store
            .get_multi(&["missing".to_string(), "content-hash".to_string()], "eng")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(only_second.video_hash, "content-hash");
    }

    #[tokio::test]
    async fn language_index_dedups_and_orders_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;

        store.save(subtitle("abc", "eng", "u1")).await.unwrap();
        store.save(subtitle("abc", "spa", "u1")).await.unwrap();
        store.save(subtitle("abc", "eng", "u1")).await.unwrap(); // override bumps eng

        let languages = store.list_languages("abc").await.unwrap();
        assert_eq!(languages, vec!["eng".to_string(), "spa".to_string()]);
    }

    #[tokio::test]
    async fn language_index_rebuilds_from_scan() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;

        store.save(subtitle("abc", "eng", "u1")).await.unwrap();
        store.save(subtitle("abc", "ger", "u1")).await.unwrap();

        // Lose the index; the next listing rebuilds it from entry keys.
        store
            .storage
            .delete(&SmdbStore::index_key("abc"), CacheType::Smdb)
            .await
            .unwrap();

        let mut languages = store.list_languages("abc").await.unwrap();
        languages.sort();
        assert_eq!(languages, vec!["eng".to_string(), "ger".to_string()]);
    }

    #[tokio::test]
    async fn hash_mappings_are_bidirectional_and_capped() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;

        store.save_hash_mapping("h1", "h2").await.unwrap();
        assert_eq!(store.hash_mappings("h1").await.unwrap(), vec!["h2"]);
        assert_eq!(store.hash_mappings("h2").await.unwrap(), vec!["h1"]);

        for i in 0..15 {
            store
                .save_hash_mapping("h1", &format!("other-{i}"))
                .await
                .unwrap();
        }
        let mappings = store.hash_mappings("h1").await.unwrap();
        assert_eq!(mappings.len(), MAX_HASH_MAPPINGS);
        assert_eq!(mappings[0], "other-14"); // most recent first
    }
}
