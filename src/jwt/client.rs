use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::error::{AppError, Result};
use crate::kms::LocalKeyStore;
use crate::models::{ClientKey, SigningAlgorithm};

use super::encoder::{decode, issue_token};
use super::envelope;
use super::keypair::ClientKeyPair;

/// Signs and verifies tokens with one locally held client key, and
/// encrypts/decrypts payloads addressed to it.
#[derive(Debug, Clone)]
pub struct TrustTokenClient {
    key_id: String,
    keypair: Arc<ClientKeyPair>,
    store: Arc<LocalKeyStore>,
}

impl TrustTokenClient {
    pub fn new(key_id: impl Into<String>, keypair: ClientKeyPair) -> Self {
        let key_id = key_id.into();
        let keypair = Arc::new(keypair);
        let store = Arc::new(LocalKeyStore::with_key(key_id.clone(), keypair.clone()));
        Self {
            key_id,
            keypair,
            store,
        }
    }

    pub fn load_from_pem(key_id: impl Into<String>, pem: &[u8]) -> Result<Self> {
        Ok(Self::new(key_id, ClientKeyPair::from_pem(pem)?))
    }

    pub fn load_from_base64_pem(key_id: impl Into<String>, encoded: &str) -> Result<Self> {
        Ok(Self::new(key_id, ClientKeyPair::from_base64_pem(encoded)?))
    }

    /// Build from a stored client key, checking the recorded algorithm still matches.
    pub fn from_client_key(key: &ClientKey) -> Result<Self> {
        let client = Self::load_from_pem(key.key_id.clone(), &key.private_key)?;
        if client.algorithm() != key.algorithm {
            return Err(AppError::InvalidKey(format!(
                "stored key {} is recorded as {} but is a {} key",
                key.key_id,
                key.algorithm,
                client.algorithm()
            )));
        }
        Ok(client)
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn algorithm(&self) -> SigningAlgorithm {
        self.keypair.algorithm()
    }

    /// Sign `claims`, adding `exp` from `expiration` and `iat` as now.
    pub async fn sign(
        &self,
        claims: Map<String, Value>,
        expiration: DateTime<Utc>,
    ) -> Result<String> {
        self.sign_at(claims, expiration, Utc::now()).await
    }

    pub async fn sign_at(
        &self,
        claims: Map<String, Value>,
        expiration: DateTime<Utc>,
        issued_at: DateTime<Utc>,
    ) -> Result<String> {
        issue_token(
            self.store.as_ref(),
            &self.key_id,
            self.algorithm(),
            claims,
            expiration,
            issued_at,
        )
        .await
    }

    pub fn verify(&self, token: &str) -> Result<Map<String, Value>> {
        self.verify_at(token, Utc::now())
    }

    /// Check header, signature and `exp` against `now`, returning the claims.
    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Result<Map<String, Value>> {
        let decoded = decode(token)?;

        if decoded.header.kid != self.key_id {
            return Err(AppError::Signature(format!(
                "token signed by unknown key {}",
                decoded.header.kid
            )));
        }
        if decoded.header.alg != self.algorithm().as_ref() {
            return Err(AppError::Signature(format!(
                "token algorithm {} does not match key",
                decoded.header.alg
            )));
        }

        self.keypair
            .verify(decoded.signing_input.as_bytes(), &decoded.signature)?;

        let exp = decoded
            .claims
            .get("exp")
            .and_then(Value::as_i64)
            .ok_or_else(|| AppError::Signature("missing exp claim".into()))?;
        if now.timestamp() >= exp {
            return Err(AppError::ExpiredToken);
        }

        Ok(decoded.claims)
    }

    /// Encrypt a JSON object to this client's public key.
    pub fn encrypt(&self, payload: &Map<String, Value>) -> Result<String> {
        envelope::seal(&self.keypair, &self.key_id, &serde_json::to_vec(payload)?)
    }

    pub fn decrypt(&self, encrypted: &str) -> Result<Map<String, Value>> {
        let plaintext = envelope::open(&self.keypair, &self.key_id, encrypted)?;
        serde_json::from_slice(&plaintext)
            .map_err(|_| AppError::Encryption("decrypted payload is not a JSON object".into()))
    }
}
