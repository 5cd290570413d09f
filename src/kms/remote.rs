use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::SigningAlgorithm;

use super::KeyManagementService;

#[derive(Debug, Serialize)]
struct SignRequest<'a> {
    /// Standard base64 of the bytes to sign
    message: String,
    algorithm: &'a str,
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    signature: String,
}

/// Signing service reached over HTTP; the private key never leaves it.
///
/// `POST {endpoint}/keys/{key_id}/sign` with `{"message", "algorithm"}`,
/// answered by `{"signature"}` (both standard base64).
#[derive(Debug, Clone)]
pub struct RemoteKms {
    client: Client,
    endpoint: String,
}

impl RemoteKms {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Config(format!("failed to build KMS client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl KeyManagementService for RemoteKms {
    async fn sign(
        &self,
        key_id: &str,
        message: &[u8],
        algorithm: SigningAlgorithm,
    ) -> Result<Vec<u8>> {
        let url = format!(
            "{}/keys/{}/sign",
            self.endpoint,
            urlencoding::encode(key_id)
        );
        let request = SignRequest {
            message: STANDARD.encode(message),
            algorithm: algorithm.as_ref(),
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::Signing(format!("KMS request failed: {}", e)))?;

        match response.status() {
            StatusCode::NOT_FOUND => return Err(AppError::KeyNotFound(key_id.to_string())),
            status if !status.is_success() => {
                let body = response.text().await.unwrap_or_default();
                return Err(AppError::Signing(format!(
                    "KMS returned {}: {}",
                    status, body
                )));
            }
            _ => {}
        }

        let signed: SignResponse = response
            .json()
            .await
            .map_err(|e| AppError::Signing(format!("invalid KMS response: {}", e)))?;

        STANDARD
            .decode(signed.signature)
            .map_err(|e| AppError::Signing(format!("KMS signature is not base64: {}", e)))
    }
}
