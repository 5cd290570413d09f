//! Per-customer license allowance ledger.
//!
//! Decisions are made against the locally synchronized copy of each
//! license. Job balances are consumed with a version check on the allowance
//! row, so two admissions racing for the last job cannot both win.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::TransactionBehavior;

use crate::config::LedgerConfig;
use crate::db::{DbPool, queries};
use crate::error::{AppError, Result};
use crate::models::{
    AllowanceMode, Decision, ExhaustionModel, LedgerEntry, REASON_BALANCE_EXHAUSTED,
    REASON_LICENSE_EXPIRED, REASON_LICENSE_NOT_FOUND,
};
use crate::util::Clock;

/// Decide whether one more job may run under `entry` at `now`.
///
/// Checked in order: missing allowance, license expiration, then the
/// allowance mode. Never mutates anything.
pub fn evaluate(entry: Option<&LedgerEntry>, now: DateTime<Utc>) -> Decision {
    let Some(entry) = entry else {
        return Decision::denied(REASON_LICENSE_NOT_FOUND);
    };

    if entry.license_expiration.is_some_and(|exp| exp <= now) {
        return Decision::denied(REASON_LICENSE_EXPIRED);
    }

    let allowance = &entry.allowance;
    match allowance.mode {
        AllowanceMode::Unlimited => Decision::allowed(),
        AllowanceMode::TimeRange => match allowance.valid_until() {
            Some(until) if allowance.valid_from <= now && now < until => Decision::allowed(),
            _ => Decision::denied(REASON_LICENSE_EXPIRED),
        },
        AllowanceMode::JobBalance => {
            if allowance.job_balance.unwrap_or(0) > 0 {
                return Decision::allowed();
            }
            match allowance.exhaustion_model {
                ExhaustionModel::Block => Decision::denied(REASON_BALANCE_EXHAUSTED),
                ExhaustionModel::Downgrade => Decision::downgraded(REASON_BALANCE_EXHAUSTED),
            }
        }
    }
}

/// Result of charging one event-driven scan to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDrivenCharge {
    pub decision: Decision,
    /// Clouds whose quota was charged
    pub charged: Vec<String>,
    pub skipped: Vec<String>,
}

impl EventDrivenCharge {
    fn rejected(decision: Decision) -> Self {
        Self {
            decision,
            charged: Vec::new(),
            skipped: Vec::new(),
        }
    }
}

pub struct LicenseAllowanceLedger {
    db: DbPool,
    clock: Arc<dyn Clock>,
    config: LedgerConfig,
}

impl LicenseAllowanceLedger {
    pub fn new(db: DbPool, clock: Arc<dyn Clock>, config: LedgerConfig) -> Self {
        Self { db, clock, config }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Whether a job may be admitted right now. Does not consume anything.
    pub fn can_consume(&self, customer_id: &str, license_key: &str) -> Result<Decision> {
        let conn = self.db.get()?;
        let entry = queries::get_ledger_entry(&conn, license_key, customer_id)?;
        Ok(evaluate(entry.as_ref(), self.now()))
    }

    /// Take one job from a `JOB_BALANCE` allowance.
    ///
    /// Returns false when there was nothing to take: other modes, an unknown
    /// customer, or an exhausted balance.
    pub fn consume(&self, customer_id: &str, license_key: &str) -> Result<bool> {
        let conn = self.db.get()?;
        let consumed = queries::decrement_job_balance(&conn, license_key, customer_id)?;
        if consumed {
            tracing::debug!(customer_id, license_key, "job balance decremented");
        }
        Ok(consumed)
    }

    /// Check and consume in one step.
    ///
    /// The allowance is re-read and re-evaluated whenever the version check
    /// loses a race; after `max_admission_retries` retries the admission fails
    /// with a conflict the caller may resubmit.
    pub fn admit(&self, customer_id: &str, license_key: &str) -> Result<Decision> {
        let conn = self.db.get()?;
        let attempts = self.config.max_admission_retries + 1;

        for attempt in 1..=attempts {
            let entry = queries::get_ledger_entry(&conn, license_key, customer_id)?;
            let decision = evaluate(entry.as_ref(), self.now());

            let Some(entry) = entry else {
                return Ok(decision);
            };
            if !decision.allow
                || decision.downgraded
                || entry.allowance.mode != AllowanceMode::JobBalance
            {
                return Ok(decision);
            }

            if queries::try_consume_job(&conn, license_key, customer_id, entry.allowance.version)? {
                return Ok(decision);
            }

            tracing::debug!(
                customer_id,
                license_key,
                attempt,
                "allowance changed during admission, retrying"
            );
        }

        tracing::warn!(customer_id, license_key, attempts, "admission gave up on contention");
        Err(AppError::ConcurrencyConflict { attempts })
    }

    /// Charge an event-driven scan to every cloud whose quota covers it.
    ///
    /// With `consume_job` the license is evaluated first and one job is taken
    /// from a `JOB_BALANCE` allowance, in the same IMMEDIATE transaction as the
    /// quota charges. A denial leaves every quota untouched, and no job is
    /// taken when no cloud could pay.
    pub fn charge_event_driven(
        &self,
        customer_id: &str,
        license_key: &str,
        clouds: &[String],
        minutes: i64,
        consume_job: bool,
    ) -> Result<EventDrivenCharge> {
        if minutes < 0 {
            return Err(AppError::BadRequest(
                "event-driven minutes must not be negative".into(),
            ));
        }
        let now = self.now();
        let mut conn = self.db.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let (decision, take_job) = if consume_job {
            let entry = queries::get_ledger_entry(&tx, license_key, customer_id)?;
            let decision = evaluate(entry.as_ref(), now);
            if !decision.allow {
                return Ok(EventDrivenCharge::rejected(decision));
            }
            let take_job = !decision.downgraded
                && entry.is_some_and(|e| e.allowance.mode == AllowanceMode::JobBalance);
            (decision, take_job)
        } else {
            (Decision::allowed(), false)
        };

        let mut charged = Vec::new();
        let mut skipped = Vec::new();
        for cloud in clouds {
            let window = self.config.event_driven_window;
            if queries::charge_event_driven_minutes(
                &tx,
                license_key,
                customer_id,
                cloud,
                minutes,
                now,
                window,
            )? {
                charged.push(cloud.clone());
            } else {
                skipped.push(cloud.clone());
            }
        }

        if take_job
            && !charged.is_empty()
            && !queries::decrement_job_balance(&tx, license_key, customer_id)?
        {
            return Ok(EventDrivenCharge::rejected(Decision::denied(
                REASON_BALANCE_EXHAUSTED,
            )));
        }

        tx.commit()?;
        Ok(EventDrivenCharge {
            decision,
            charged,
            skipped,
        })
    }

    /// Record `minutes` of event-driven scanning for one cloud if the quota allows it.
    pub fn can_consume_event_driven(
        &self,
        customer_id: &str,
        license_key: &str,
        cloud: &str,
        minutes: i64,
    ) -> Result<bool> {
        if minutes < 0 {
            return Err(AppError::BadRequest(
                "event-driven minutes must not be negative".into(),
            ));
        }
        let mut conn = self.db.get()?;
        queries::try_record_event_driven_usage(
            &mut conn,
            license_key,
            customer_id,
            cloud,
            minutes,
            self.now(),
            self.config.event_driven_window,
        )
    }
}
