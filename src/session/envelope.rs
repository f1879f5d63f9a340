//! Session envelope: the stored binding between a token and an encrypted
//! user config.
//!
//! A session is identified twice on purpose. The wrapper fields (`token`,
//! `tokenFingerprint`, `fingerprint`, `integrity`) name it from the outside;
//! `__sessionToken`/`__sessionFingerprint` embedded inside the config name
//! it from the inside. If a shared storage substrate ever returns another
//! tenant's payload under this key (prefix collision, proxy mix-up, restore
//! from the wrong snapshot), the two identities disagree and the session is
//! rejected instead of leaking across tenants.

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::model::UserConfig;

/// Hex length of a session token (128 random bits).
pub const TOKEN_LENGTH: usize = 32;

/// Truncation lengths for the derived digests.
const TOKEN_FINGERPRINT_LEN: usize = 16;
const CONFIG_FINGERPRINT_LEN: usize = 16;
const INTEGRITY_LEN: usize = 24;

/// Generate a cryptographically strong session token: 128 random bits as
/// 32 lowercase hex characters.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_LENGTH / 2];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Token shape check (`^[a-f0-9]{32}$`). Anything else is rejected before
/// it reaches storage.
pub fn is_valid_token(token: &str) -> bool {
    token.len() == TOKEN_LENGTH
        && token
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// 16-char truncated SHA-256 of the token.
pub fn token_fingerprint(token: &str) -> String {
    sha256_hex(token)[..TOKEN_FINGERPRINT_LEN].to_string()
}

/// 16-char truncated SHA-256 of the decrypted config, session metadata
/// stripped. Computed over the canonical JSON serialization.
pub fn config_fingerprint(config: &UserConfig) -> String {
    let payload = serde_json::to_string(&config.without_session_metadata())
        .unwrap_or_default();
    sha256_hex(&payload)[..CONFIG_FINGERPRINT_LEN].to_string()
}

/// 24-char truncated SHA-256 over `token|fingerprint`, binding the two so a
/// payload swapped between keys is detectable.
pub fn integrity_hash(token: &str, fingerprint: &str) -> String {
    sha256_hex(&format!("{token}|{fingerprint}"))[..INTEGRITY_LEN].to_string()
}

/// The persisted session record. The derived fields are optional because
/// entries written by earlier releases may lack them; retrieval backfills
/// and persists them rather than discarding the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEnvelope {
    pub token: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_fingerprint: Option<String>,

    /// User config with its sensitive fields individually encrypted.
    pub config: UserConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,

    pub created_at: DateTime<Utc>,

    pub last_accessed_at: DateTime<Utc>,
}

impl SessionEnvelope {
    /// Sliding inactivity expiry on `lastAccessedAt`, with a forward
    /// clock-skew allowance so a peer with a fast clock cannot expire a
    /// fresh session.
    pub fn is_expired(&self, max_age: std::time::Duration, skew: std::time::Duration) -> bool {
        match Utc::now()
            .signed_duration_since(self.last_accessed_at)
            .to_std()
        {
            Ok(age) => age > max_age + skew,
            // A last access in the future is clock skew, not expiry.
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn generated_tokens_are_well_formed_and_distinct() {
        let a = generate_token();
        let b = generate_token();
        assert!(is_valid_token(&a));
        assert!(is_valid_token(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn token_shape_is_strict() {
        assert!(is_valid_token(&"a1".repeat(16)));
        assert!(!is_valid_token(""));
        assert!(!is_valid_token(&"a1".repeat(15)));
        assert!(!is_valid_token(&"A1".repeat(16))); // uppercase rejected
        assert!(!is_valid_token(&"g1".repeat(16))); // non-hex rejected
        assert!(!is_valid_token("../../../etc/passwd"));
    }

    #[test]
    fn digest_lengths() {
        let token = generate_token();
        let fp = config_fingerprint(&UserConfig::default());
        assert_eq!(token_fingerprint(&token).len(), 16);
        assert_eq!(fp.len(), 16);
        assert_eq!(integrity_hash(&token, &fp).len(), 24);
    }

    #[test]
    fn integrity_binds_token_and_fingerprint() {
        let fp = "f".repeat(16);
        let a = integrity_hash(&"a".repeat(32), &fp);
        let b = integrity_hash(&"b".repeat(32), &fp);
        assert_ne!(a, b);
        assert_eq!(a, integrity_hash(&"a".repeat(32), &fp));
    }

    #[test]
    fn config_fingerprint_tracks_content_not_metadata() {
        let mut config = UserConfig {
            gemini_api_key: Some("K".into()),
            ..Default::default()
        };
        let before = config_fingerprint(&config);

        config.session_token = Some("t".repeat(32));
        config.encrypted = true;
        assert_eq!(config_fingerprint(&config), before);

        config.gemini_api_key = Some("other".into());
        assert_ne!(config_fingerprint(&config), before);
    }

    #[test]
    fn sliding_expiry_with_skew_tolerance() {
        let envelope = SessionEnvelope {
            token: generate_token(),
            token_fingerprint: None,
            config: UserConfig::default(),
            fingerprint: None,
            integrity: None,
            created_at: Utc::now() - chrono::Duration::days(100),
            last_accessed_at: Utc::now() - chrono::Duration::days(91),
        };
        let day = Duration::from_secs(24 * 60 * 60);
        let skew = Duration::from_secs(3600);

        // 91 days idle: expired under a 90-day budget, alive under 92 days.
        assert!(envelope.is_expired(90 * day, skew));
        assert!(!envelope.is_expired(92 * day, skew));
    }
}
