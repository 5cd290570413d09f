use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::error::{AppError, Result};
use crate::jwt::ClientKeyPair;
use crate::models::SigningAlgorithm;

use super::KeyManagementService;

/// In-process key holder.
#[derive(Debug, Default)]
pub struct LocalKeyStore {
    keys: RwLock<HashMap<String, Arc<ClientKeyPair>>>,
}

impl LocalKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(key_id: impl Into<String>, keypair: Arc<ClientKeyPair>) -> Self {
        let store = Self::new();
        store.insert(key_id, keypair);
        store
    }

    fn insert(&self, key_id: impl Into<String>, keypair: Arc<ClientKeyPair>) {
        self.keys
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key_id.into(), keypair);
    }

    fn get(&self, key_id: &str) -> Option<Arc<ClientKeyPair>> {
        self.keys
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key_id)
            .cloned()
    }
}

#[async_trait]
impl KeyManagementService for LocalKeyStore {
    async fn sign(
        &self,
        key_id: &str,
        message: &[u8],
        algorithm: SigningAlgorithm,
    ) -> Result<Vec<u8>> {
        let keypair = self
            .get(key_id)
            .ok_or_else(|| AppError::KeyNotFound(key_id.to_string()))?;

        if keypair.algorithm() != algorithm {
            return Err(AppError::Signing(format!(
                "key {} signs with {}, not {}",
                key_id,
                keypair.algorithm(),
                algorithm
            )));
        }

        keypair.sign(message)
    }
}
