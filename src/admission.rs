//! Admission control in front of scan execution.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::jwt::TokenIssuer;
use crate::ledger::LicenseAllowanceLedger;
use crate::license_manager::{LicenseManagerApi, PermissionRequest};
use crate::models::Decision;

/// Where allow/deny answers come from.
#[derive(Clone)]
pub enum DecisionSource {
    /// The local ledger, kept current by sync
    Ledger,
    /// Ask the License Manager on every admission
    Authority {
        api: Arc<dyn LicenseManagerApi>,
        issuer: Arc<TokenIssuer>,
        tenant_id: String,
        token_lifetime: chrono::Duration,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionRequest {
    pub customer_id: String,
    pub license_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventDrivenRequest {
    pub customer_id: String,
    pub license_key: String,
    pub clouds: Vec<String>,
    /// Expected scan duration charged against each cloud's quota
    pub minutes: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Admission {
    pub admitted: bool,
    pub downgraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl From<Decision> for Admission {
    fn from(decision: Decision) -> Self {
        Self {
            admitted: decision.allow,
            downgraded: decision.downgraded,
            reason: decision.reason,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventDrivenAdmission {
    pub downgraded: bool,
    /// Clouds whose quota covered the scan
    pub admitted: Vec<String>,
    /// Clouds without an active quota or with too few minutes left
    pub skipped: Vec<String>,
}

/// Every job passes through here before it runs.
pub struct JobAdmissionGate {
    ledger: Arc<LicenseAllowanceLedger>,
    source: DecisionSource,
}

impl JobAdmissionGate {
    pub fn new(ledger: Arc<LicenseAllowanceLedger>, source: DecisionSource) -> Self {
        Self { ledger, source }
    }

    /// Admit one job, consuming from the customer's allowance.
    ///
    /// A denial is returned as [`AppError::LicenseDenied`] carrying the reason.
    pub async fn admit(&self, customer_id: &str, license_key: &str) -> Result<Admission> {
        let decision = match &self.source {
            DecisionSource::Ledger => self.ledger.admit(customer_id, license_key)?,
            DecisionSource::Authority { .. } => self.ask_authority(customer_id, license_key).await?,
        };
        self.finish(customer_id, license_key, decision)
    }

    /// Admit an automatically triggered scan across several clouds.
    ///
    /// The license must admit the job first; each cloud is then charged
    /// `minutes` against its own quota, and clouds that cannot pay are
    /// skipped. One job is consumed if at least one cloud was admitted. With
    /// the ledger as source, a denial charges no cloud.
    pub async fn admit_event_driven(
        &self,
        request: &EventDrivenRequest,
    ) -> Result<EventDrivenAdmission> {
        let EventDrivenRequest {
            customer_id,
            license_key,
            clouds,
            minutes,
        } = request;

        let authority = match &self.source {
            DecisionSource::Ledger => None,
            DecisionSource::Authority { .. } => {
                let decision = self.ask_authority(customer_id, license_key).await?;
                if !decision.allow {
                    return Err(self.deny(customer_id, license_key, decision));
                }
                Some(decision)
            }
        };

        let charge = self.ledger.charge_event_driven(
            customer_id,
            license_key,
            clouds,
            *minutes,
            authority.is_none(),
        )?;
        if !charge.decision.allow {
            return Err(self.deny(customer_id, license_key, charge.decision));
        }
        for cloud in &charge.skipped {
            tracing::info!(
                customer_id,
                license_key,
                cloud,
                "event-driven quota exhausted, skipping cloud"
            );
        }

        let downgraded = authority.unwrap_or(charge.decision).downgraded;
        Ok(EventDrivenAdmission {
            downgraded,
            admitted: charge.charged,
            skipped: charge.skipped,
        })
    }

    async fn ask_authority(&self, customer_id: &str, license_key: &str) -> Result<Decision> {
        let DecisionSource::Authority {
            api,
            issuer,
            tenant_id,
            token_lifetime,
        } = &self.source
        else {
            return Err(AppError::Internal("no license authority configured".into()));
        };

        let token = issuer
            .bearer_token(tenant_id, *token_lifetime, self.ledger.now())
            .await?;
        let request = PermissionRequest {
            tenant_id: tenant_id.clone(),
            customer_id: customer_id.to_string(),
            license_key: license_key.to_string(),
        };
        api.check_permission(&token, &request).await
    }

    fn finish(
        &self,
        customer_id: &str,
        license_key: &str,
        decision: Decision,
    ) -> Result<Admission> {
        if !decision.allow {
            return Err(self.deny(customer_id, license_key, decision));
        }
        if decision.downgraded {
            tracing::info!(customer_id, license_key, "job admitted downgraded");
        } else {
            tracing::info!(customer_id, license_key, "job admitted");
        }
        Ok(decision.into())
    }

    fn deny(&self, customer_id: &str, license_key: &str, decision: Decision) -> AppError {
        let reason = decision.reason.unwrap_or_else(|| "denied".to_string());
        tracing::warn!(customer_id, license_key, reason = %reason, "job denied");
        AppError::LicenseDenied(reason)
    }
}
