//! Session snapshot persistence.
//!
//! When enabled, the manager periodically writes every known session
//! envelope to a JSON file, and on startup restores from it if the primary
//! store reports zero sessions. This recovers from volume loss of the
//! primary store without users noticing.

use std::{collections::HashMap, path::Path};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::envelope::SessionEnvelope;

/// Snapshot file layout: `{"sessions": {<token>: <envelope>}, "savedAt": ...}`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub sessions: HashMap<String, SessionEnvelope>,
    pub saved_at: DateTime<Utc>,
}

/// Write a snapshot atomically (temp file, then rename).
pub async fn save_snapshot(
    path: &Path,
    sessions: HashMap<String, SessionEnvelope>,
) -> std::io::Result<usize> {
    let count = sessions.len();
    let snapshot = SessionSnapshot {
        sessions,
        saved_at: Utc::now(),
    };
    let bytes = serde_json::to_vec(&snapshot)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(count)
}

/// Load a snapshot if one exists and parses. A corrupt snapshot is reported
/// as absent; restore is best-effort recovery, not a source of truth.
pub async fn load_snapshot(path: &Path) -> Option<SessionSnapshot> {
    let bytes = tokio::fs::read(path).await.ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Session snapshot unreadable; ignoring");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{model::UserConfig, session::envelope::generate_token};

    #[tokio::test]
    async fn snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshots").join("sessions.json");

        let token = generate_token();
        let mut sessions = HashMap::new();
        sessions.insert(
            token.clone(),
            SessionEnvelope {
                token: token.clone(),
                token_fingerprint: None,
                config: UserConfig::default(),
                fingerprint: None,
                integrity: None,
                created_at: Utc::now(),
                last_accessed_at: Utc::now(),
            },
        );

        let count = save_snapshot(&path, sessions).await.unwrap();
        assert_eq!(count, 1);

        let restored = load_snapshot(&path).await.unwrap();
        assert!(restored.sessions.contains_key(&token));
    }

    #[tokio::test]
    async fn corrupt_snapshot_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        assert!(load_snapshot(&path).await.is_none());
    }

    #[tokio::test]
    async fn missing_snapshot_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_snapshot(&dir.path().join("nope.json")).await.is_none());
    }
}
