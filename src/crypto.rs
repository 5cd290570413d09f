//! Envelope encryption for secrets stored in the database.
//!
//! Each record gets its own AES-256-GCM key, derived from the master key with
//! HKDF-SHA256 and the record's identifier as context. Ciphertext layout:
//! `ENC1 || nonce (12) || ciphertext+tag`.

use std::fmt;

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{AppError, Result};

const MAGIC: &[u8; 4] = b"ENC1";
const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;

#[derive(Clone)]
pub struct MasterKey {
    key: [u8; KEY_SIZE],
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey([redacted])")
    }
}

impl MasterKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let key: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            AppError::Config(format!(
                "master key must be {} bytes, got {}",
                KEY_SIZE,
                bytes.len()
            ))
        })?;
        Ok(Self { key })
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| AppError::Config(format!("master key is not valid base64: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    /// Generate a random master key (dev setups and tests).
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self { key }
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.key)
    }

    fn derive(&self, context: &str) -> Result<Aes256Gcm> {
        let hk = Hkdf::<Sha256>::new(None, &self.key);
        let mut okm = [0u8; KEY_SIZE];
        hk.expand(format!("scanguard-record-v1:{}", context).as_bytes(), &mut okm)
            .map_err(|e| AppError::Encryption(format!("key derivation failed: {}", e)))?;
        Aes256Gcm::new_from_slice(&okm)
            .map_err(|e| AppError::Encryption(format!("invalid derived key: {}", e)))
    }

    pub fn encrypt(&self, context: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = self.derive(context)?;
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| AppError::Encryption(e.to_string()))?;

        let mut out = Vec::with_capacity(MAGIC.len() + NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, context: &str, data: &[u8]) -> Result<Vec<u8>> {
        let body = data
            .strip_prefix(MAGIC.as_slice())
            .ok_or_else(|| AppError::Encryption("unrecognized ciphertext format".into()))?;
        if body.len() < NONCE_SIZE {
            return Err(AppError::Encryption("ciphertext too short".into()));
        }
        let (nonce, ciphertext) = body.split_at(NONCE_SIZE);

        self.derive(context)?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| AppError::Encryption("decryption failed (wrong key or context)".into()))
    }
}

/// SHA-256 of arbitrary bytes, hex encoded.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
