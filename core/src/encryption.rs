//! Payload encryption with AES-256-GCM.
//!
//! The wire layout is `[IV bytes | ciphertext]` when the IV is generated per
//! message; when a fixed IV is configured no prefix is emitted and both sides
//! must share the configured value. The GCM authentication tag is part of the
//! ciphertext, so tampering surfaces as a decryption failure.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};

use crate::error::PipelineError;

/// AES-256-GCM key length in bytes.
pub const KEY_LEN: usize = 32;
/// GCM nonce (IV) length in bytes.
pub const IV_LEN: usize = 12;

/// Encryption settings of an endpoint.
#[derive(Clone)]
pub struct EncryptionSettings {
    key: [u8; KEY_LEN],
    /// Optional key identifier, emitted as `x-encryption-key-id` so the
    /// consuming side can select the matching key during rotation.
    pub key_id: Option<String>,
    /// Fixed IV. When set, no IV prefix is emitted on the wire.
    pub fixed_iv: Option<[u8; IV_LEN]>,
}

impl EncryptionSettings {
    /// Create settings with a per-message random IV.
    #[must_use]
    pub const fn new(key: [u8; KEY_LEN]) -> Self {
        Self {
            key,
            key_id: None,
            fixed_iv: None,
        }
    }

    /// Attach a key identifier emitted with every encrypted message.
    #[must_use]
    pub fn with_key_id(mut self, key_id: impl Into<String>) -> Self {
        self.key_id = Some(key_id.into());
        self
    }

    /// Use a fixed IV instead of generating one per message.
    #[must_use]
    pub const fn with_fixed_iv(mut self, iv: [u8; IV_LEN]) -> Self {
        self.fixed_iv = Some(iv);
        self
    }
}

impl std::fmt::Debug for EncryptionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The key never reaches logs.
        f.debug_struct("EncryptionSettings")
            .field("key_id", &self.key_id)
            .field("fixed_iv", &self.fixed_iv.is_some())
            .finish()
    }
}

/// Encrypt a message body.
///
/// # Errors
///
/// Returns [`PipelineError::Serialization`] when the cipher rejects the
/// input.
pub fn encrypt_body(body: &[u8], settings: &EncryptionSettings) -> Result<Vec<u8>, PipelineError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&settings.key));

    let iv: [u8; IV_LEN] = settings.fixed_iv.unwrap_or_else(rand::random);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), body)
        .map_err(|e| PipelineError::Serialization(format!("encryption failed: {e}")))?;

    if settings.fixed_iv.is_some() {
        Ok(ciphertext)
    } else {
        let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }
}

/// Decrypt a message body, consuming the IV prefix when the settings use a
/// per-message IV.
///
/// # Errors
///
/// Returns [`PipelineError::Serialization`] when the body is too short or
/// authentication fails.
pub fn decrypt_body(body: &[u8], settings: &EncryptionSettings) -> Result<Vec<u8>, PipelineError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&settings.key));

    let (iv, ciphertext): (&[u8], &[u8]) = match &settings.fixed_iv {
        Some(fixed) => (fixed.as_slice(), body),
        None => {
            if body.len() < IV_LEN {
                return Err(PipelineError::Serialization(format!(
                    "encrypted body too short: {} bytes, expected at least {IV_LEN}",
                    body.len()
                )));
            }
            body.split_at(IV_LEN)
        }
    };

    cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|e| PipelineError::Serialization(format!("decryption failed: {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    fn settings() -> EncryptionSettings {
        EncryptionSettings::new([7; KEY_LEN])
    }

    #[test]
    fn roundtrip_with_random_iv() {
        let body = b"the quick brown fox";
        let encrypted = encrypt_body(body, &settings()).unwrap();

        assert_ne!(&encrypted[IV_LEN..], body.as_slice());
        assert_eq!(decrypt_body(&encrypted, &settings()).unwrap(), body);
    }

    #[test]
    fn iv_prefix_roundtrips_bit_exactly() {
        let encrypted = encrypt_body(b"payload", &settings()).unwrap();
        let iv = &encrypted[..IV_LEN];

        // Same plaintext encrypted again gets a different IV (and prefix).
        let encrypted2 = encrypt_body(b"payload", &settings()).unwrap();
        assert_ne!(iv, &encrypted2[..IV_LEN]);
    }

    #[test]
    fn fixed_iv_emits_no_prefix() {
        let fixed = settings().with_fixed_iv([9; IV_LEN]);
        let a = encrypt_body(b"payload", &fixed).unwrap();
        let b = encrypt_body(b"payload", &fixed).unwrap();

        // Deterministic: same key, same IV, same ciphertext, no prefix.
        assert_eq!(a, b);
        assert_eq!(decrypt_body(&a, &fixed).unwrap(), b"payload");
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let encrypted = encrypt_body(b"secret", &settings()).unwrap();
        let other = EncryptionSettings::new([8; KEY_LEN]);

        assert!(matches!(
            decrypt_body(&encrypted, &other),
            Err(PipelineError::Serialization(_))
        ));
    }

    #[test]
    fn truncated_body_is_rejected() {
        assert!(decrypt_body(&[1, 2, 3], &settings()).is_err());
    }

    #[test]
    fn debug_redacts_key() {
        let debug = format!("{:?}", settings().with_key_id("key-1"));
        assert!(debug.contains("key-1"));
        assert!(!debug.contains('7'));
    }
}
