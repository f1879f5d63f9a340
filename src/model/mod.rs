//! User configuration carried inside a session envelope.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

fn is_false(value: &bool) -> bool {
    !*value
}

/// Per-provider credential bundle. Unknown provider parameters ride along
/// in `extra` untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderCredentials {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// An alternative AI provider slot (OpenAI-compatible endpoints and the
/// like), each with its own key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AlternativeProvider {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

/// A user's addon configuration: language selections, provider choices,
/// credentials, and cache toggles.
///
/// Sensitive fields are encrypted individually before the config is
/// serialized into a session envelope; the `__encrypted` sentinel marks a
/// config whose fields currently hold ciphertext. `__sessionToken` and
/// `__sessionFingerprint` are the embedded identity used to detect payloads
/// returned under the wrong key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserConfig {
    /// Preferred source subtitle language.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_language: Option<String>,

    /// Translation target languages, in priority order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<String>,

    /// Selected AI translation provider.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_provider: Option<String>,

    /// Primary AI key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gemini_api_key: Option<String>,

    /// Rotation pool; round-robin selection spreads rate-limit load.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub gemini_api_keys: Vec<String>,

    #[serde(skip_serializing_if = "is_false")]
    pub key_rotation_enabled: bool,

    /// Auxiliary key for ASR/captioning.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcription_api_key: Option<String>,

    /// Subtitle-provider credentials keyed by provider id
    /// (opensubtitles, subdl, subsource, ...).
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub providers: BTreeMap<String, ProviderCredentials>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub alternative_providers: Vec<AlternativeProvider>,

    pub cache_subtitles: bool,

    pub cache_translations: bool,

    #[serde(rename = "__sessionToken", skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,

    #[serde(rename = "__sessionFingerprint", skip_serializing_if = "Option::is_none")]
    pub session_fingerprint: Option<String>,

    #[serde(rename = "__encrypted", skip_serializing_if = "is_false")]
    pub encrypted: bool,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            source_language: None,
            targets: Vec::new(),
            ai_provider: None,
            gemini_api_key: None,
            gemini_api_keys: Vec::new(),
            key_rotation_enabled: false,
            transcription_api_key: None,
            providers: BTreeMap::new(),
            alternative_providers: Vec::new(),
            cache_subtitles: true,
            cache_translations: true,
            session_token: None,
            session_fingerprint: None,
            encrypted: false,
        }
    }
}

impl UserConfig {
    /// Apply defaults and structural caps after parsing or decryption:
    /// empty strings collapse to `None`, target lists deduplicate, and the
    /// rotation pool is capped at `max_api_keys`.
    pub fn normalize(&mut self, max_api_keys: usize) {
        fn clean(field: &mut Option<String>) {
            if field.as_deref().is_some_and(|v| v.trim().is_empty()) {
                *field = None;
            }
        }
        clean(&mut self.source_language);
        clean(&mut self.gemini_api_key);
        clean(&mut self.transcription_api_key);

        let mut seen = std::collections::HashSet::new();
        self.targets.retain(|lang| {
            let trimmed = lang.trim();
            !trimmed.is_empty() && seen.insert(trimmed.to_string())
        });

        self.gemini_api_keys.retain(|k| !k.trim().is_empty());
        if self.gemini_api_keys.len() > max_api_keys {
            tracing::warn!(
                configured = self.gemini_api_keys.len(),
                cap = max_api_keys,
                "Rotation key pool exceeds cap; truncating"
            );
            self.gemini_api_keys.truncate(max_api_keys);
        }
    }

    /// The config as it participates in fingerprinting: embedded session
    /// metadata and the encryption sentinel stripped out.
    pub fn without_session_metadata(&self) -> UserConfig {
        let mut stripped = self.clone();
        stripped.session_token = None;
        stripped.session_fingerprint = None;
        stripped.encrypted = false;
        stripped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_caps_rotation_pool_and_dedups_targets() {
        let mut config = UserConfig {
            targets: vec![
                "spa".into(),
                "spa".into(),
                " ".into(),
                "fre".into(),
            ],
            gemini_api_keys: (0..8).map(|i| format!("K{i}")).collect(),
            gemini_api_key: Some("  ".into()),
            ..Default::default()
        };
        config.normalize(5);

        assert_eq!(config.targets, vec!["spa".to_string(), "fre".to_string()]);
        assert_eq!(config.gemini_api_keys.len(), 5);
        assert!(config.gemini_api_key.is_none());
    }

    #[test]
    fn session_metadata_serializes_under_dunder_names() {
        let config = UserConfig {
            session_token: Some("ab".repeat(16)),
            session_fingerprint: Some("f".repeat(16)),
            ..Default::default()
        };
        let json = serde_json::to_value(&config).unwrap();
        assert!(json.get("__sessionToken").is_some());
        assert!(json.get("__sessionFingerprint").is_some());
        assert!(json.get("__encrypted").is_none());
    }

    #[test]
    fn fingerprint_payload_ignores_metadata() {
        let bare = UserConfig {
            gemini_api_key: Some("K".into()),
            ..Default::default()
        };
        let mut tagged = bare.clone();
        tagged.session_token = Some("t".repeat(32));
        tagged.session_fingerprint = Some("f".repeat(16));
        tagged.encrypted = true;

        assert_eq!(bare.without_session_metadata(), tagged.without_session_metadata());
    }
}
