//! Payload encryption for bus envelopes
//!
//! Bot answers on the broker may still carry the personal data the PII
//! check is about to redact. The bus can seal envelope payloads at
//! publish time and open them before handing them to a handler,
//! independent of transport encryption. Key rotation is supported via
//! key IDs.

use crate::error::{ModerationError, Result};
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Encrypted payload envelope stored in `envelope.payload`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedPayload {
    /// Identifies which key was used for encryption
    pub key_id: String,

    /// Base64-encoded nonce (96-bit for AES-256-GCM)
    pub nonce: String,

    /// Base64-encoded ciphertext
    pub ciphertext: String,

    /// Marker to identify encrypted payloads
    #[serde(default = "default_encrypted")]
    pub encrypted: bool,
}

fn default_encrypted() -> bool {
    true
}

impl EncryptedPayload {
    /// Check if a JSON value is an encrypted payload
    pub fn is_encrypted(value: &serde_json::Value) -> bool {
        value
            .get("encrypted")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Trait for sealing and opening envelope payloads
pub trait PayloadEncryptor: Send + Sync {
    /// Encrypt a JSON payload, returning an encrypted envelope as JSON
    fn encrypt(&self, payload: &serde_json::Value) -> Result<serde_json::Value>;

    /// Decrypt an encrypted envelope back to the original JSON payload
    fn decrypt(&self, encrypted: &serde_json::Value) -> Result<serde_json::Value>;

    /// The current active key ID used for encryption
    fn active_key_id(&self) -> &str;
}

/// AES-256-GCM encryptor with key rotation support
///
/// Encrypts with the active key, decrypts with any registered key.
pub struct Aes256GcmEncryptor {
    active_key_id: String,

    /// All registered keys (key_id → cipher)
    keys: RwLock<HashMap<String, Aes256Gcm>>,
}

fn cipher_for(key: &[u8; 32]) -> Aes256Gcm {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key))
}

fn lock_error(e: impl std::fmt::Display) -> ModerationError {
    ModerationError::Encryption(format!("Failed to acquire key lock: {}", e))
}

impl Aes256GcmEncryptor {
    /// Create a new encryptor with a single 256-bit key
    pub fn new(key_id: impl Into<String>, key: &[u8; 32]) -> Self {
        let key_id = key_id.into();
        let mut keys = HashMap::new();
        keys.insert(key_id.clone(), cipher_for(key));

        Self {
            active_key_id: key_id,
            keys: RwLock::new(keys),
        }
    }

    /// Add a key for decryption
    ///
    /// Old keys remain available for payloads sealed before rotation.
    pub fn add_key(&self, key_id: impl Into<String>, key: &[u8; 32]) -> Result<()> {
        let mut keys = self.keys.write().map_err(lock_error)?;
        keys.insert(key_id.into(), cipher_for(key));
        Ok(())
    }

    /// Rotate to a new active key, which must already be registered
    pub fn rotate_to(&mut self, key_id: &str) -> Result<()> {
        let keys = self.keys.read().map_err(lock_error)?;
        if !keys.contains_key(key_id) {
            return Err(ModerationError::Encryption(format!(
                "Key '{}' not registered, add it first",
                key_id
            )));
        }
        drop(keys);
        self.active_key_id = key_id.to_string();
        Ok(())
    }
}

impl PayloadEncryptor for Aes256GcmEncryptor {
    fn encrypt(&self, payload: &serde_json::Value) -> Result<serde_json::Value> {
        let plaintext = serde_json::to_vec(payload)?;

        let keys = self.keys.read().map_err(lock_error)?;
        let cipher = keys.get(&self.active_key_id).ok_or_else(|| {
            ModerationError::Encryption(format!("Active key '{}' not found", self.active_key_id))
        })?;

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_ref())
            .map_err(|e| ModerationError::Encryption(format!("Encryption failed: {}", e)))?;

        let sealed = EncryptedPayload {
            key_id: self.active_key_id.clone(),
            nonce: BASE64.encode(nonce),
            ciphertext: BASE64.encode(ciphertext),
            encrypted: true,
        };

        serde_json::to_value(sealed).map_err(Into::into)
    }

    fn decrypt(&self, encrypted: &serde_json::Value) -> Result<serde_json::Value> {
        let sealed: EncryptedPayload = serde_json::from_value(encrypted.clone())?;

        let keys = self.keys.read().map_err(lock_error)?;
        let cipher = keys.get(&sealed.key_id).ok_or_else(|| {
            ModerationError::Encryption(format!("Decryption key '{}' not registered", sealed.key_id))
        })?;

        let nonce_bytes = BASE64
            .decode(&sealed.nonce)
            .map_err(|e| ModerationError::Encryption(format!("Invalid nonce encoding: {}", e)))?;
        if nonce_bytes.len() != 12 {
            return Err(ModerationError::Encryption(format!(
                "Invalid nonce length {}",
                nonce_bytes.len()
            )));
        }
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = BASE64
            .decode(&sealed.ciphertext)
            .map_err(|e| ModerationError::Encryption(format!("Invalid ciphertext encoding: {}", e)))?;

        let plaintext = cipher
            .decrypt(nonce, ciphertext.as_ref())
            .map_err(|e| ModerationError::Encryption(format!("Decryption failed: {}", e)))?;

        serde_json::from_slice(&plaintext).map_err(Into::into)
    }

    fn active_key_id(&self) -> &str {
        &self.active_key_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; 32] {
        [0x42; 32]
    }

    #[test]
    fn test_seal_and_open_message() {
        let enc = Aes256GcmEncryptor::new("key-1", &test_key());
        let payload = serde_json::json!({
            "question": "Where does Ivan live?",
            "answer": "Passport 4510 123456, Lenina st."
        });

        let sealed = enc.encrypt(&payload).unwrap();
        assert!(EncryptedPayload::is_encrypted(&sealed));
        assert!(!sealed.to_string().contains("4510"));

        assert_eq!(enc.decrypt(&sealed).unwrap(), payload);
    }

    #[test]
    fn test_is_encrypted_false_for_plain() {
        assert!(!EncryptedPayload::is_encrypted(&serde_json::json!({"answer": "hi"})));
    }

    #[test]
    fn test_key_rotation_keeps_old_payloads_readable() {
        let mut enc = Aes256GcmEncryptor::new("key-1", &test_key());
        let payload = serde_json::json!({"answer": "secret"});
        let v1 = enc.encrypt(&payload).unwrap();

        enc.add_key("key-2", &[0x7A; 32]).unwrap();
        enc.rotate_to("key-2").unwrap();
        assert_eq!(enc.active_key_id(), "key-2");
        let v2 = enc.encrypt(&payload).unwrap();

        assert_eq!(v1["keyId"], "key-1");
        assert_eq!(v2["keyId"], "key-2");
        assert_eq!(enc.decrypt(&v1).unwrap(), payload);
        assert_eq!(enc.decrypt(&v2).unwrap(), payload);
    }

    #[test]
    fn test_rotate_to_unknown_key_fails() {
        let mut enc = Aes256GcmEncryptor::new("key-1", &test_key());
        assert!(enc.rotate_to("nonexistent").is_err());
    }

    #[test]
    fn test_decrypt_with_wrong_key_fails() {
        let enc1 = Aes256GcmEncryptor::new("key-1", &test_key());
        let enc2 = Aes256GcmEncryptor::new("key-2", &[0x7A; 32]);
        enc2.add_key("key-1", &[0xFF; 32]).unwrap();

        let sealed = enc1.encrypt(&serde_json::json!({"data": 1})).unwrap();
        assert!(matches!(enc2.decrypt(&sealed), Err(ModerationError::Encryption(_))));
    }

    #[test]
    fn test_identical_partials_seal_differently() {
        let enc = Aes256GcmEncryptor::new("key-1", &test_key());
        let partial = serde_json::json!({"safe": true, "score": 0.1, "masked_answer": "ok"});

        let first: EncryptedPayload = serde_json::from_value(enc.encrypt(&partial).unwrap()).unwrap();
        let second: EncryptedPayload = serde_json::from_value(enc.encrypt(&partial).unwrap()).unwrap();
        assert_ne!(first.nonce, second.nonce);
        assert_ne!(first.ciphertext, second.ciphertext);
    }
}
