//! Per-field encryption of the sensitive parts of a user config.
//!
//! The whole config is never encrypted as one blob; the enumerated sensitive
//! fields are encrypted in place and everything else stays readable. The
//! enumeration is mirrored exactly by decryption, with one hard rule: a
//! value that carries the envelope version tag but fails to decrypt comes
//! back as a CLEARED field, never as the ciphertext. Ciphertext returned as
//! an API key would be forwarded verbatim in an Authorization header to a
//! third party.

use crate::model::UserConfig;

use super::CryptoService;

/// A decrypted config plus the fields whose decryption failed. Warnings
/// identify the field paths so operators can spot a cross-instance key
/// mismatch from logs.
#[derive(Debug)]
pub struct DecryptOutcome {
    pub config: UserConfig,
    pub warnings: Vec<String>,
}

impl DecryptOutcome {
    pub fn clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

impl CryptoService {
    /// Encrypt the enumerated sensitive fields in place and set the
    /// `__encrypted` sentinel. Values already in envelope form are left
    /// untouched, so re-encrypting an encrypted config is a no-op.
    pub fn encrypt_user_config(&self, config: &UserConfig) -> Result<UserConfig, super::CryptoError> {
        let mut sealed = config.clone();

        self.seal_field(&mut sealed.gemini_api_key)?;
        for key in sealed.gemini_api_keys.iter_mut() {
            self.seal_value(key)?;
        }
        self.seal_field(&mut sealed.transcription_api_key)?;
        for credentials in sealed.providers.values_mut() {
            self.seal_field(&mut credentials.api_key)?;
            self.seal_field(&mut credentials.username)?;
            self.seal_field(&mut credentials.password)?;
        }
        for provider in sealed.alternative_providers.iter_mut() {
            self.seal_field(&mut provider.api_key)?;
        }

        sealed.encrypted = true;
        Ok(sealed)
    }

    /// Mirror of [`encrypt_user_config`](Self::encrypt_user_config).
    ///
    /// Legacy values that never were encrypted pass through as-is. Encrypted
    /// values that fail authentication are cleared and reported.
    pub fn decrypt_user_config(&self, config: &UserConfig) -> DecryptOutcome {
        let mut opened = config.clone();
        let mut warnings = Vec::new();

        self.open_field(&mut opened.gemini_api_key, "geminiApiKey", &mut warnings);

        let mut failed_rotation = Vec::new();
        for (i, key) in opened.gemini_api_keys.iter_mut().enumerate() {
            if !CryptoService::is_encrypted(key) {
                continue;
            }
            match self.decrypt(key) {
                Some(plain) => *key = plain,
                None => {
                    warnings.push(format!("geminiApiKeys[{i}]"));
                    failed_rotation.push(i);
                }
            }
        }
        // Drop unreadable pool entries entirely; rotation must never hand
        // out ciphertext.
        for i in failed_rotation.into_iter().rev() {
            opened.gemini_api_keys.remove(i);
        }

        self.open_field(
            &mut opened.transcription_api_key,
            "transcriptionApiKey",
            &mut warnings,
        );
        for (name, credentials) in opened.providers.iter_mut() {
            self.open_field(
                &mut credentials.api_key,
                &format!("providers.{name}.apiKey"),
                &mut warnings,
            );
            self.open_field(
                &mut credentials.username,
                &format!("providers.{name}.username"),
                &mut warnings,
            );
            self.open_field(
                &mut credentials.password,
                &format!("providers.{name}.password"),
                &mut warnings,
            );
        }
        for (i, provider) in opened.alternative_providers.iter_mut().enumerate() {
            self.open_field(
                &mut provider.api_key,
                &format!("alternativeProviders[{i}].apiKey"),
                &mut warnings,
            );
        }

        opened.encrypted = false;
        if !warnings.is_empty() {
            tracing::warn!(
                fields = ?warnings,
                "Config fields failed decryption and were cleared; check for an \
                 encryption key mismatch across instances"
            );
        }
        DecryptOutcome {
            config: opened,
            warnings,
        }
    }

    fn seal_field(&self, field: &mut Option<String>) -> Result<(), super::CryptoError> {
        if let Some(value) = field {
            self.seal_value(value)?;
        }
        Ok(())
    }

    fn seal_value(&self, value: &mut String) -> Result<(), super::CryptoError> {
        if !value.is_empty() && !CryptoService::is_encrypted(value) {
            *value = self.encrypt(value)?;
        }
        Ok(())
    }

    fn open_field(&self, field: &mut Option<String>, path: &str, warnings: &mut Vec<String>) {
        let Some(value) = field else {
            return;
        };
        if !CryptoService::is_encrypted(value) {
            return;
        }
        match self.decrypt(value) {
            Some(plain) => *field = Some(plain),
            None => {
                warnings.push(path.to_string());
                *field = None;
            }
        }
    }
}
