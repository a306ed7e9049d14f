//! Device credential decryption
//!
//! Ciphertext format: `enc:v1:<base64(nonce || aes-256-gcm ciphertext)>`.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::Aes256Gcm;
use base64::Engine;
use rand::RngCore;
use thiserror::Error;

pub const CIPHERTEXT_PREFIX: &str = "enc:v1:";

const NONCE_LEN: usize = 12;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SecretError {
    #[error("no encryption key configured")]
    NoKey,

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid ciphertext: {0}")]
    InvalidCiphertext(String),

    #[error("decryption failed")]
    Decryption,

    #[error("encryption failed")]
    Encryption,
}

/// Decrypts stored device credentials
pub trait SecretStore: Send + Sync {
    fn decrypt(&self, ciphertext: &str) -> Result<String, SecretError>;
}

/// AES-256-GCM secret store keyed by a 32-byte key
#[derive(Clone)]
pub struct AesGcmSecretStore {
    key: Option<[u8; 32]>,
}

impl std::fmt::Debug for AesGcmSecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmSecretStore")
            .field("key", &self.key.map(|_| "***"))
            .finish()
    }
}

impl AesGcmSecretStore {
    /// Store without a key: every decrypt fails with [`SecretError::NoKey`]
    pub fn keyless() -> Self {
        Self { key: None }
    }

    /// Build from a 64-character hex key
    pub fn from_hex(hex_key: &str) -> Result<Self, SecretError> {
        let bytes = hex::decode(hex_key.trim()).map_err(|e| SecretError::InvalidKey(e.to_string()))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| SecretError::InvalidKey(format!("expected 32 bytes, got {}", b.len())))?;
        Ok(Self { key: Some(key) })
    }

    /// Read the hex key from an environment variable; keyless when unset
    pub fn from_env(var: &str) -> Result<Self, SecretError> {
        match std::env::var(var) {
            Ok(hex_key) if !hex_key.trim().is_empty() => Self::from_hex(&hex_key),
            _ => {
                tracing::warn!("{} not set, credentials cannot be decrypted", var);
                Ok(Self::keyless())
            }
        }
    }

    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, SecretError> {
        let key = self.key.ok_or(SecretError::NoKey)?;
        let cipher = Aes256Gcm::new(GenericArray::from_slice(&key));

        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(GenericArray::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| SecretError::Encryption)?;

        let mut data = nonce.to_vec();
        data.extend_from_slice(&ciphertext);
        Ok(format!(
            "{}{}",
            CIPHERTEXT_PREFIX,
            base64::engine::general_purpose::STANDARD.encode(data)
        ))
    }
}

impl SecretStore for AesGcmSecretStore {
    fn decrypt(&self, ciphertext: &str) -> Result<String, SecretError> {
        let b64 = ciphertext
            .strip_prefix(CIPHERTEXT_PREFIX)
            .ok_or_else(|| SecretError::InvalidCiphertext(format!("missing '{}' prefix", CIPHERTEXT_PREFIX)))?;
        let key = self.key.ok_or(SecretError::NoKey)?;

        let data = base64::engine::general_purpose::STANDARD
            .decode(b64)
            .map_err(|e| SecretError::InvalidCiphertext(format!("invalid base64: {}", e)))?;
        if data.len() < NONCE_LEN {
            return Err(SecretError::InvalidCiphertext("data too short".into()));
        }

        let (nonce, sealed) = data.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(GenericArray::from_slice(&key));
        let plaintext = cipher
            .decrypt(GenericArray::from_slice(nonce), sealed)
            .map_err(|_| SecretError::Decryption)?;

        String::from_utf8(plaintext).map_err(|_| SecretError::Decryption)
    }
}
