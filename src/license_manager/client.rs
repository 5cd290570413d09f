use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::config::LicenseManagerEndpoint;
use crate::error::{AppError, Result};
use crate::models::{ArtifactRef, Decision, LicenseRecord, RuleMetadata, RulesetMetadata};

use super::{LicenseManagerApi, PermissionRequest};

#[derive(Debug, Deserialize)]
struct PermissionResponse {
    allowed: bool,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    downgraded: bool,
}

/// License Manager reached over HTTPS (or HTTP for local setups).
#[derive(Debug, Clone)]
pub struct HttpLicenseManager {
    client: Client,
    base_url: String,
}

impl HttpLicenseManager {
    pub fn new(endpoint: &LicenseManagerEndpoint, timeout: Duration) -> Result<Self> {
        Self::with_base_url(endpoint.base_url(), timeout)
    }

    pub fn with_base_url(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn get(&self, path: &str, token: &str) -> RequestBuilder {
        self.client
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(token)
    }

    async fn send(&self, path: &str, request: RequestBuilder) -> Result<Response> {
        let response = request.send().await.map_err(|e| {
            AppError::LicenseManager(format!("request to {} failed: {}", path, e))
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AppError::LicenseManager(format!(
                "{} rejected the client token ({})",
                path, status
            )),
            _ => AppError::LicenseManager(format!("{} returned {}: {}", path, status, body)),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, token: &str) -> Result<T> {
        let response = self.send(path, self.get(path, token)).await?;
        response.json().await.map_err(|e| {
            AppError::LicenseManager(format!("invalid response from {}: {}", path, e))
        })
    }
}

#[async_trait]
impl LicenseManagerApi for HttpLicenseManager {
    async fn fetch_rule_metadata(&self, token: &str) -> Result<Vec<RuleMetadata>> {
        self.get_json("/rules/meta", token).await
    }

    async fn fetch_licenses(&self, token: &str) -> Result<Vec<LicenseRecord>> {
        self.get_json("/licenses", token).await
    }

    async fn list_ruleset_artifacts(&self, token: &str) -> Result<Vec<ArtifactRef>> {
        self.get_json("/rulesets/artifacts", token).await
    }

    async fn download_artifact(&self, token: &str, artifact: &ArtifactRef) -> Result<Vec<u8>> {
        let path = format!(
            "/rulesets/{}/versions/{}/artifact",
            urlencoding::encode(&artifact.ruleset_id),
            urlencoding::encode(&artifact.version)
        );
        let response = self.send(&path, self.get(&path, token)).await?;
        let bytes = response.bytes().await.map_err(|e| {
            AppError::LicenseManager(format!("artifact download from {} failed: {}", path, e))
        })?;
        Ok(bytes.to_vec())
    }

    async fn fetch_ruleset_metadata(&self, token: &str) -> Result<Vec<RulesetMetadata>> {
        self.get_json("/rulesets/meta", token).await
    }

    async fn check_permission(
        &self,
        token: &str,
        request: &PermissionRequest,
    ) -> Result<Decision> {
        let path = "/jobs/permission";
        let builder = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(token)
            .json(request);
        let response: PermissionResponse = self
            .send(path, builder)
            .await?
            .json()
            .await
            .map_err(|e| {
                AppError::LicenseManager(format!("invalid response from {}: {}", path, e))
            })?;

        Ok(Decision {
            allow: response.allowed,
            reason: response.reason,
            downgraded: response.allowed && response.downgraded,
        })
    }
}
