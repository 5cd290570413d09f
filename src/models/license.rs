use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::error::{AppError, Result};
use crate::util::{parse_iso8601_duration, truncate_to_secs};

pub const REASON_BALANCE_EXHAUSTED: &str = "job balance exhausted";
pub const REASON_LICENSE_EXPIRED: &str = "license expired";
pub const REASON_LICENSE_NOT_FOUND: &str = "license not found";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AllowanceMode {
    TimeRange,
    JobBalance,
    Unlimited,
}

/// Policy applied once a job balance reaches zero.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    AsRefStr,
    Display,
    EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ExhaustionModel {
    #[default]
    Block,
    /// Keep admitting with `downgraded` set; the executor decides what reduced service means
    Downgrade,
}

/// Allowance state of one customer under one license.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerAllowance {
    pub mode: AllowanceMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_balance: Option<i64>,
    /// ISO-8601 duration, e.g. `P30D`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_range: Option<String>,
    pub exhaustion_model: ExhaustionModel,
    pub valid_from: DateTime<Utc>,
    /// Optimistic concurrency counter, bumped on every write
    #[serde(skip)]
    pub version: i64,
}

impl CustomerAllowance {
    /// End of the time window for `TIME_RANGE` allowances.
    pub fn valid_until(&self) -> Option<DateTime<Utc>> {
        let range = self.time_range.as_deref().and_then(parse_iso8601_duration)?;
        self.valid_from.checked_add_signed(range)
    }

    /// Same allowance ignoring the version counter.
    pub fn same_terms(&self, other: &CustomerAllowance) -> bool {
        self.mode == other.mode
            && self.job_balance == other.job_balance
            && self.time_range == other.time_range
            && self.exhaustion_model == other.exhaustion_model
            && self.valid_from == other.valid_from
    }
}

/// A customer's allowance together with the expiration of its license.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub allowance: CustomerAllowance,
    pub license_expiration: Option<DateTime<Utc>>,
}

/// Allowance terms as issued by the License Manager.
///
/// The authority may send both `job_balance` and `time_range`. When `mode` is
/// absent, a job balance takes precedence over a time range.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowanceTerms {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<AllowanceMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_balance: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_range: Option<String>,
    #[serde(default)]
    pub exhaustion_model: ExhaustionModel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<DateTime<Utc>>,
}

impl AllowanceTerms {
    pub fn resolved_mode(&self) -> AllowanceMode {
        if let Some(mode) = self.mode {
            return mode;
        }
        if self.job_balance.is_some() {
            AllowanceMode::JobBalance
        } else if self.time_range.is_some() {
            AllowanceMode::TimeRange
        } else {
            AllowanceMode::Unlimited
        }
    }

    /// Resolve into a single-mode allowance. Only the active mode's parameter is kept.
    pub fn to_allowance(&self, valid_from: DateTime<Utc>) -> Result<CustomerAllowance> {
        let mode = self.resolved_mode();
        let (job_balance, time_range) = match mode {
            AllowanceMode::JobBalance => {
                let balance = self.job_balance.ok_or_else(|| {
                    AppError::BadRequest("JOB_BALANCE allowance without job_balance".into())
                })?;
                (Some(balance.max(0)), None)
            }
            AllowanceMode::TimeRange => {
                let range = self.time_range.clone().ok_or_else(|| {
                    AppError::BadRequest("TIME_RANGE allowance without time_range".into())
                })?;
                if parse_iso8601_duration(&range).is_none() {
                    return Err(AppError::BadRequest(format!(
                        "invalid time_range duration: {}",
                        range
                    )));
                }
                (None, Some(range))
            }
            AllowanceMode::Unlimited => (None, None),
        };

        Ok(CustomerAllowance {
            mode,
            job_balance,
            time_range,
            exhaustion_model: self.exhaustion_model,
            valid_from: truncate_to_secs(self.valid_from.unwrap_or(valid_from)),
            version: 0,
        })
    }
}

/// License-level event-driven settings from the License Manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDrivenTerms {
    pub active: bool,
    pub quota_minutes: i64,
    #[serde(default)]
    pub clouds: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_execution: Option<DateTime<Utc>>,
}

/// Per-customer, per-cloud minute budget for automatically triggered scans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDrivenQuota {
    pub customer_id: String,
    pub cloud: String,
    pub active: bool,
    pub quota_minutes: i64,
    pub last_execution: Option<DateTime<Utc>>,
    pub consumed_minutes: i64,
    pub window_started_at: Option<DateTime<Utc>>,
}

impl EventDrivenQuota {
    /// Minutes already used in the window that contains `now`.
    pub fn consumed_at(&self, now: DateTime<Utc>, window: Duration) -> i64 {
        match self.window_started_at {
            Some(start) if now - start < window => self.consumed_minutes,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct License {
    pub license_key: String,
    pub customers: BTreeMap<String, CustomerAllowance>,
    pub ruleset_ids: BTreeSet<String>,
    pub expiration: Option<DateTime<Utc>>,
    pub latest_sync: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowance: Option<AllowanceTerms>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_driven: Option<EventDrivenTerms>,
}

/// A license as published by the License Manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseRecord {
    pub license_key: String,
    #[serde(default)]
    pub expiration: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ruleset_ids: BTreeSet<String>,
    /// License-wide terms, used for customers without their own
    #[serde(default)]
    pub allowance: Option<AllowanceTerms>,
    #[serde(default)]
    pub customers: BTreeMap<String, Option<AllowanceTerms>>,
    #[serde(default)]
    pub event_driven: Option<EventDrivenTerms>,
    /// Per-license secret, encrypted to the tenant's client key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

impl LicenseRecord {
    pub fn terms_for(&self, customer_id: &str) -> AllowanceTerms {
        self.customers
            .get(customer_id)
            .cloned()
            .flatten()
            .or_else(|| self.allowance.clone())
            .unwrap_or_default()
    }
}

/// What a customer removal took with it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CustomerRemoval {
    pub allowances: usize,
    pub licenses: usize,
}

/// Result of an admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub allow: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub downgraded: bool,
}

impl Decision {
    pub fn allowed() -> Self {
        Self {
            allow: true,
            reason: None,
            downgraded: false,
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            allow: false,
            reason: Some(reason.into()),
            downgraded: false,
        }
    }

    pub fn downgraded(reason: impl Into<String>) -> Self {
        Self {
            allow: true,
            reason: Some(reason.into()),
            downgraded: true,
        }
    }
}
