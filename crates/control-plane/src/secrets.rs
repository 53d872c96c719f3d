//! Credential encryption for storage backend configuration.
//!
//! Secrets at rest are wrapped in a versioned envelope:
//! `"v1:" + base64(nonce(12) || tag(16) || ciphertext)` under AES-256-GCM.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose, Engine as _};
use rand::RngCore;
use serde_json::Value;

const ENVELOPE_PREFIX: &str = "v1:";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Config fields that hold credentials and get encrypted at rest.
pub const SECRET_FIELDS: &[&str] = &["secret_key", "password", "private_key", "passphrase"];

/// Replacement value used when secrets are shown to operators.
pub const REDACTION_MASK: &str = "********";

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("master key must be 32 bytes, got {0}")]
    BadKeyLength(usize),
    #[error("master key is not valid base64: {0}")]
    BadKeyEncoding(#[from] base64::DecodeError),
    #[error("value is not a v1 envelope")]
    NotAnEnvelope,
    #[error("envelope payload is malformed")]
    MalformedEnvelope,
    #[error("decryption failed")]
    DecryptFailed,
    #[error("encryption failed")]
    EncryptFailed,
}

/// AES-256-GCM cipher over a fixed master key.
#[derive(Clone)]
pub struct SecretCipher {
    key: [u8; 32],
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCipher").finish_non_exhaustive()
    }
}

impl SecretCipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Builds a cipher from a base64-encoded 32-byte key.
    pub fn from_base64(encoded: &str) -> Result<Self, SecretError> {
        let decoded = general_purpose::STANDARD.decode(encoded)?;
        let key: [u8; 32] = decoded
            .as_slice()
            .try_into()
            .map_err(|_| SecretError::BadKeyLength(decoded.len()))?;
        Ok(Self::new(key))
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, SecretError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        // aes-gcm appends the tag to the ciphertext; the envelope stores the
        // tag before the ciphertext instead.
        let sealed = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| SecretError::EncryptFailed)?;
        if sealed.len() < TAG_LEN {
            return Err(SecretError::EncryptFailed);
        }
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        let mut payload = Vec::with_capacity(NONCE_LEN + sealed.len());
        payload.extend_from_slice(&nonce_bytes);
        payload.extend_from_slice(tag);
        payload.extend_from_slice(ciphertext);

        Ok(format!(
            "{ENVELOPE_PREFIX}{}",
            general_purpose::STANDARD.encode(payload)
        ))
    }

    pub fn decrypt(&self, envelope: &str) -> Result<String, SecretError> {
        let encoded = envelope
            .strip_prefix(ENVELOPE_PREFIX)
            .ok_or(SecretError::NotAnEnvelope)?;
        let payload = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| SecretError::MalformedEnvelope)?;
        if payload.len() < NONCE_LEN + TAG_LEN {
            return Err(SecretError::MalformedEnvelope);
        }

        let (nonce_bytes, rest) = payload.split_at(NONCE_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);

        let mut sealed = Vec::with_capacity(rest.len());
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(tag);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), sealed.as_slice())
            .map_err(|_| SecretError::DecryptFailed)?;
        String::from_utf8(plaintext).map_err(|_| SecretError::DecryptFailed)
    }

    /// Decrypts a value that may or may not be enveloped. Plain values pass
    /// through untouched so existing unencrypted configs keep working.
    pub fn decrypt_value(&self, value: &str) -> Result<String, SecretError> {
        if is_envelope(value) {
            self.decrypt(value)
        } else {
            Ok(value.to_string())
        }
    }

    /// Encrypts every known credential field of a JSON object in place.
    /// Already-enveloped values are left alone.
    pub fn encrypt_fields(&self, object: &mut Value) -> Result<(), SecretError> {
        let Some(map) = object.as_object_mut() else {
            return Ok(());
        };
        for field in SECRET_FIELDS {
            if let Some(Value::String(raw)) = map.get(*field) {
                if raw.is_empty() || is_envelope(raw) {
                    continue;
                }
                let sealed = self.encrypt(raw)?;
                map.insert((*field).to_string(), Value::String(sealed));
            }
        }
        Ok(())
    }

    /// Decrypts every known credential field of a JSON object in place.
    pub fn decrypt_fields(&self, object: &mut Value) -> Result<(), SecretError> {
        let Some(map) = object.as_object_mut() else {
            return Ok(());
        };
        for field in SECRET_FIELDS {
            if let Some(Value::String(raw)) = map.get(*field) {
                if !is_envelope(raw) {
                    continue;
                }
                let plain = self.decrypt(raw)?;
                map.insert((*field).to_string(), Value::String(plain));
            }
        }
        Ok(())
    }
}

pub fn is_envelope(value: &str) -> bool {
    value.starts_with(ENVELOPE_PREFIX)
}

/// Masks every known credential field before the object leaves the plane.
pub fn redact_fields(object: &mut Value) {
    let Some(map) = object.as_object_mut() else {
        return;
    };
    for field in SECRET_FIELDS {
        if let Some(Value::String(raw)) = map.get(*field) {
            if !raw.is_empty() {
                map.insert((*field).to_string(), Value::String(REDACTION_MASK.to_string()));
            }
        }
    }
}
