use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};

use crate::crypto::MasterKey;
use crate::db::{DbPool, queries};
use crate::error::{AppError, Result};
use crate::kms::KeyManagementService;
use crate::models::SigningAlgorithm;

use super::client::TrustTokenClient;
use super::encoder::issue_token;

/// The tenant's client key as currently registered in `client_keys`.
///
/// The decrypted key is cached until the stored row changes. Deleting the
/// key stops issuance on the next token; replacing it switches every later
/// token to the new key.
pub struct RegisteredClientKey {
    db: DbPool,
    master_key: MasterKey,
    cached: RwLock<Option<CachedClient>>,
}

struct CachedClient {
    private_key_enc: Vec<u8>,
    client: TrustTokenClient,
}

impl RegisteredClientKey {
    pub fn new(db: DbPool, master_key: MasterKey) -> Self {
        Self {
            db,
            master_key,
            cached: RwLock::new(None),
        }
    }

    /// The active client, or [`AppError::KeyNotFound`] when no key is registered.
    pub fn current(&self) -> Result<TrustTokenClient> {
        let conn = self.db.get()?;
        let Some(ciphertext) = queries::get_active_client_key_ciphertext(&conn)? else {
            let evicted = self
                .cached
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            if let Some(evicted) = evicted {
                tracing::info!(key_id = %evicted.client.key_id(), "client key removed");
            }
            return Err(AppError::KeyNotFound("no client key registered".into()));
        };

        {
            let cached = self.cached.read().unwrap_or_else(|e| e.into_inner());
            if let Some(cached) = cached.as_ref()
                && cached.private_key_enc == ciphertext
            {
                return Ok(cached.client.clone());
            }
        }

        let key = queries::get_active_client_key(&conn, &self.master_key)?
            .ok_or_else(|| AppError::KeyNotFound("no client key registered".into()))?;
        let client = TrustTokenClient::from_client_key(&key)?;
        tracing::info!(
            key_id = %client.key_id(),
            algorithm = %client.algorithm(),
            "client key loaded"
        );

        *self.cached.write().unwrap_or_else(|e| e.into_inner()) = Some(CachedClient {
            private_key_enc: ciphertext,
            client: client.clone(),
        });
        Ok(client)
    }
}

/// Produces the tenant's bearer tokens toward the License Manager, whichever
/// side holds the private key.
#[derive(Clone)]
pub enum TokenIssuer {
    Local(Arc<RegisteredClientKey>),
    Remote {
        kms: Arc<dyn KeyManagementService>,
        key_id: String,
        algorithm: SigningAlgorithm,
    },
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenIssuer::Local(_) => f.write_str("Local"),
            TokenIssuer::Remote {
                key_id, algorithm, ..
            } => f
                .debug_struct("Remote")
                .field("key_id", key_id)
                .field("algorithm", algorithm)
                .finish(),
        }
    }
}

impl TokenIssuer {
    /// The local client, when the private key is held in-process.
    pub fn local_client(&self) -> Result<Option<TrustTokenClient>> {
        match self {
            TokenIssuer::Local(source) => source.current().map(Some),
            TokenIssuer::Remote { .. } => Ok(None),
        }
    }

    pub async fn issue(
        &self,
        claims: Map<String, Value>,
        expiration: DateTime<Utc>,
        issued_at: DateTime<Utc>,
    ) -> Result<String> {
        match self {
            TokenIssuer::Local(source) => {
                let client = source.current()?;
                client.sign_at(claims, expiration, issued_at).await
            }
            TokenIssuer::Remote {
                kms,
                key_id,
                algorithm,
            } => issue_token(kms.as_ref(), key_id, *algorithm, claims, expiration, issued_at).await,
        }
    }

    /// Short-lived token identifying `tenant_id` to the License Manager.
    pub async fn bearer_token(
        &self,
        tenant_id: &str,
        lifetime: Duration,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let mut claims = Map::new();
        claims.insert("tenant_id".into(), Value::from(tenant_id));
        self.issue(claims, now + lifetime, now).await
    }
}
