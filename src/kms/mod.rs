//! Key management: who holds the client private key and signs on its behalf.

mod local;
mod remote;

pub use local::LocalKeyStore;
pub use remote::RemoteKms;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::SigningAlgorithm;

/// Signs bytes with a key it holds, identified by `key_id`.
///
/// Implementations return [`crate::error::AppError::KeyNotFound`] for unknown
/// keys and [`crate::error::AppError::Signing`] for any other failure.
#[async_trait]
pub trait KeyManagementService: Send + Sync {
    async fn sign(
        &self,
        key_id: &str,
        message: &[u8],
        algorithm: SigningAlgorithm,
    ) -> Result<Vec<u8>>;
}
