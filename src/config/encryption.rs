use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::{env_string, ConfigError};

/// Encryption key acquisition.
///
/// Resolution order: `ENCRYPTION_KEY` env var, then the keyfile, then a
/// freshly generated key persisted to the keyfile. A keyfile that exists but
/// cannot be parsed aborts startup rather than being overwritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EncryptionConfig {
    /// 64 hex characters (256-bit key). Overrides the keyfile.
    #[serde(default)]
    pub key: Option<String>,

    /// Keyfile location for persisted keys.
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            key: None,
            key_file: default_key_file(),
        }
    }
}

impl EncryptionConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.key = env_string("ENCRYPTION_KEY");
        if let Some(path) = env_string("ENCRYPTION_KEY_FILE") {
            config.key_file = PathBuf::from(path);
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(key) = &self.key {
            if key.len() != 64 || !key.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(ConfigError::Validation(
                    "ENCRYPTION_KEY must be exactly 64 hex characters".into(),
                ));
            }
        }
        Ok(())
    }
}

fn default_key_file() -> PathBuf {
    PathBuf::from("./encryption.key")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_key() {
        let config = EncryptionConfig {
            key: Some("abc123".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn accepts_64_hex() {
        let config = EncryptionConfig {
            key: Some("a".repeat(64)),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
