//! The License Manager: the upstream authority for rules, licenses and rulesets.

mod client;

pub use client::HttpLicenseManager;

use async_trait::async_trait;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::config::LicenseManagerEndpoint;
use crate::db::queries;
use crate::error::Result;
use crate::models::{ArtifactRef, Decision, LicenseRecord, RuleMetadata, RulesetMetadata};

/// Admission question put to the License Manager in authority mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub tenant_id: String,
    pub customer_id: String,
    pub license_key: String,
}

/// Calls made against the License Manager. Every call carries a bearer
/// token signed with the tenant's client key.
#[async_trait]
pub trait LicenseManagerApi: Send + Sync {
    async fn fetch_rule_metadata(&self, token: &str) -> Result<Vec<RuleMetadata>>;

    async fn fetch_licenses(&self, token: &str) -> Result<Vec<LicenseRecord>>;

    async fn list_ruleset_artifacts(&self, token: &str) -> Result<Vec<ArtifactRef>>;

    async fn download_artifact(&self, token: &str, artifact: &ArtifactRef) -> Result<Vec<u8>>;

    async fn fetch_ruleset_metadata(&self, token: &str) -> Result<Vec<RulesetMetadata>>;

    async fn check_permission(&self, token: &str, request: &PermissionRequest)
    -> Result<Decision>;
}

/// Settings key for an operator-configured License Manager endpoint.
pub const ENDPOINT_SETTING: &str = "license_manager_endpoint";

/// The stored endpoint if one was configured, else `fallback` from the environment.
pub fn resolve_endpoint(
    conn: &Connection,
    fallback: &LicenseManagerEndpoint,
) -> Result<LicenseManagerEndpoint> {
    Ok(queries::get_setting(conn, ENDPOINT_SETTING)?.unwrap_or_else(|| fallback.clone()))
}

pub fn save_endpoint(conn: &Connection, endpoint: &LicenseManagerEndpoint) -> Result<bool> {
    queries::put_setting(conn, ENDPOINT_SETTING, endpoint)
}

/// Forget the stored endpoint so the environment's applies again.
pub fn clear_endpoint(conn: &Connection) -> Result<bool> {
    queries::delete_setting(conn, ENDPOINT_SETTING)
}
