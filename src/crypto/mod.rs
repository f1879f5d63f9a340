//! Authenticated encryption for user secrets.
//!
//! Secrets (AI provider keys, subtitle-provider credentials) are encrypted
//! with AES-256-GCM before they touch storage. The envelope is the ASCII
//! string `1:<iv_b64>:<tag_b64>:<ciphertext_b64>`; the leading `1` is a
//! version tag permitting future algorithm rotation, and the GCM tag makes
//! any tampering fail decryption outright.
//!
//! The key comes from `ENCRYPTION_KEY` (64 hex chars), else a keyfile, else
//! it is generated once and persisted. Two startup failures are deliberately
//! fatal: a keyfile that exists but cannot be parsed (overwriting it would
//! strand all previous ciphertext), and a fresh key that cannot be persisted
//! (an in-memory-only key invalidates every session on restart).

mod fields;

use std::path::{Path, PathBuf};

use aes_gcm::{
    aead::{consts::U16, generic_array::GenericArray, Aead, KeyInit},
    aes::Aes256,
    AesGcm,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;

pub use fields::DecryptOutcome;

use crate::config::EncryptionConfig;

/// AES-256-GCM with the 128-bit IV this envelope format carries.
type EnvelopeCipher = AesGcm<Aes256, U16>;

const ENVELOPE_VERSION: &str = "1";
const KEY_BYTES: usize = 32;
const IV_BYTES: usize = 16;
const TAG_BYTES: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("ENCRYPTION_KEY must be 64 hex characters")]
    InvalidKey,

    #[error(
        "Keyfile {0} exists but does not contain a valid key; refusing to overwrite it. \
         Restore the keyfile or remove it after confirming no encrypted data remains."
    )]
    KeyfileCorrupt(PathBuf),

    #[error("Failed to persist generated encryption key to {0}: {1}")]
    KeyfilePersist(PathBuf, std::io::Error),

    #[error("Encryption failed")]
    Encrypt,
}

pub struct CryptoService {
    cipher: EnvelopeCipher,
}

impl CryptoService {
    /// Acquire the key and build the service. Order: configured/env key,
    /// keyfile, freshly generated key written to the keyfile.
    pub fn initialize(config: &EncryptionConfig) -> Result<Self, CryptoError> {
        if let Some(hex_key) = &config.key {
            let key = parse_hex_key(hex_key).ok_or(CryptoError::InvalidKey)?;
            tracing::debug!("Using encryption key from environment");
            return Self::from_key(key);
        }

        match std::fs::read_to_string(&config.key_file) {
            Ok(contents) => {
                let key = parse_hex_key(contents.trim())
                    .ok_or_else(|| CryptoError::KeyfileCorrupt(config.key_file.clone()))?;
                tracing::debug!(path = %config.key_file.display(), "Loaded encryption key from keyfile");
                Self::from_key(key)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let key = generate_key();
                persist_key(&config.key_file, &key)
                    .map_err(|e| CryptoError::KeyfilePersist(config.key_file.clone(), e))?;
                tracing::warn!(
                    path = %config.key_file.display(),
                    "Generated a new encryption key. Back this file up: losing it makes \
                     every stored session unrecoverable"
                );
                Self::from_key(key)
            }
            Err(e) => Err(CryptoError::KeyfilePersist(config.key_file.clone(), e)),
        }
    }

    /// Build the service from raw key material.
    pub fn from_key(key: [u8; KEY_BYTES]) -> Result<Self, CryptoError> {
        let cipher =
            EnvelopeCipher::new_from_slice(&key).map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self { cipher })
    }

    /// Encrypt a plaintext into an envelope string.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let mut iv = [0u8; IV_BYTES];
        rand::thread_rng().fill_bytes(&mut iv);

        let mut sealed = self
            .cipher
            .encrypt(GenericArray::from_slice(&iv), plaintext.as_bytes())
            .map_err(|_| CryptoError::Encrypt)?;

        // RustCrypto appends the tag to the ciphertext; the envelope carries
        // them as separate fields.
        let tag = sealed.split_off(sealed.len() - TAG_BYTES);
        Ok(format!(
            "{}:{}:{}:{}",
            ENVELOPE_VERSION,
            BASE64.encode(iv),
            BASE64.encode(tag),
            BASE64.encode(sealed)
        ))
    }

    /// Decrypt an envelope. Returns `None` on any malformation or
    /// authentication failure; callers never see partial plaintext.
    pub fn decrypt(&self, envelope: &str) -> Option<String> {
        let mut parts = envelope.splitn(4, ':');
        let version = parts.next()?;
        if version != ENVELOPE_VERSION {
            return None;
        }
        let iv = BASE64.decode(parts.next()?).ok()?;
        let tag = BASE64.decode(parts.next()?).ok()?;
        let ciphertext = BASE64.decode(parts.next()?).ok()?;
        if iv.len() != IV_BYTES || tag.len() != TAG_BYTES {
            return None;
        }

        let mut sealed = ciphertext;
        sealed.extend_from_slice(&tag);

        let plaintext = self
            .cipher
            .decrypt(GenericArray::from_slice(&iv), sealed.as_ref())
            .ok()?;
        String::from_utf8(plaintext).ok()
    }

    /// Whether a value carries the envelope shape (four colon-separated
    /// fields under the version tag). The ciphertext field may be empty;
    /// IV and tag may not.
    pub fn is_encrypted(value: &str) -> bool {
        let parts: Vec<&str> = value.split(':').collect();
        parts.len() == 4
            && parts[0] == ENVELOPE_VERSION
            && !parts[1].is_empty()
            && !parts[2].is_empty()
            && parts[1..].iter().all(|p| BASE64.decode(p).is_ok())
    }
}

fn parse_hex_key(raw: &str) -> Option<[u8; KEY_BYTES]> {
    if raw.len() != KEY_BYTES * 2 {
        return None;
    }
    let bytes = hex::decode(raw).ok()?;
    bytes.try_into().ok()
}

fn generate_key() -> [u8; KEY_BYTES] {
    let mut key = [0u8; KEY_BYTES];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// Write the key atomically with owner-only permissions.
fn persist_key(path: &Path, key: &[u8; KEY_BYTES]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, hex::encode(key))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
    }
    std::fs::rename(&tmp, path)
}
