//! Key hygiene applied by every backend.
//!
//! Redis patterns have glob semantics and the filesystem backend maps keys to
//! paths, so structural characters in a caller-supplied key could address a
//! different entry than intended. Sanitization is mandatory: backends call
//! [`sanitize_key`] before touching storage, never the raw key.

use sha2::{Digest, Sha256};

use super::error::{StorageError, StorageResult};

/// Hard maximum for a sanitized key, in bytes.
pub const MAX_KEY_BYTES: usize = 250;

/// Keys over the maximum are truncated to this many characters before the
/// disambiguating digest suffix is appended.
const TRUNCATED_KEY_CHARS: usize = 200;

/// Sanitize a caller-supplied cache key.
///
/// Wildcard and structural characters (`* ? [ ] \`), control bytes, and
/// whitespace are replaced with underscores. Oversized keys are truncated and
/// suffixed with a 16-hex-char SHA-256 of the original so distinct long keys
/// stay distinct.
pub fn sanitize_key(key: &str) -> StorageResult<String> {
    if key.is_empty() {
        return Err(StorageError::InvalidKey("key must not be empty".into()));
    }

    let mut sanitized: String = key
        .chars()
        .map(|c| match c {
            '*' | '?' | '[' | ']' | '\\' => '_',
            c if c.is_control() || c.is_whitespace() => '_',
            c => c,
        })
        .collect();

    if sanitized.len() > MAX_KEY_BYTES {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        let head: String = sanitized.chars().take(TRUNCATED_KEY_CHARS).collect();
        sanitized = format!("{}_{}", head, &digest[..16]);
    }

    Ok(sanitized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_key() {
        assert!(matches!(
            sanitize_key(""),
            Err(StorageError::InvalidKey(_))
        ));
    }

    #[test]
    fn replaces_glob_and_control_characters() {
        let sanitized = sanitize_key("movie*123?[en]\\x\r\n\0 y").unwrap();
        assert_eq!(sanitized, "movie_123__en__x____y");
    }

    #[test]
    fn passes_clean_keys_through() {
        assert_eq!(sanitize_key("abc123:eng:srt").unwrap(), "abc123:eng:srt");
    }

    #[test]
    fn long_keys_truncate_with_digest_suffix() {
        let long_a = "a".repeat(400);
        let long_b = format!("{}b", "a".repeat(399));

        let out_a = sanitize_key(&long_a).unwrap();
        let out_b = sanitize_key(&long_b).unwrap();

        assert!(out_a.len() <= MAX_KEY_BYTES);
        assert_ne!(out_a, out_b, "distinct long keys must stay distinct");
        assert!(out_a.starts_with(&"a".repeat(200)));
    }

    #[test]
    fn hostile_key_cannot_alias_another() {
        // A glob that would match "abc" under raw KEYS semantics maps to a
        // literal underscore form instead.
        let sanitized = sanitize_key("ab*").unwrap();
        assert_eq!(sanitized, "ab_");
        assert_ne!(sanitized, "abc");
    }
}
