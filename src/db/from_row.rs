//! Row mapping for the query layer.
//!
//! Each `*_COLS` constant lists the columns its `FromRow` impl reads, in order.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, ToSql};
use serde::de::DeserializeOwned;

use crate::error::Result;
use crate::models::*;
use crate::util::from_epoch;

pub trait FromRow: Sized {
    fn from_row(row: &Row) -> rusqlite::Result<Self>;
}

pub fn query_one<T: FromRow>(
    conn: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
) -> Result<Option<T>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    match rows.next()? {
        Some(row) => Ok(Some(T::from_row(row)?)),
        None => Ok(None),
    }
}

pub fn query_all<T: FromRow>(
    conn: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, T::from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn timestamp(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let secs: i64 = row.get(idx)?;
    from_epoch(secs).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, secs))
}

fn timestamp_opt(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(secs) => from_epoch(secs)
            .map(Some)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, secs)),
        None => Ok(None),
    }
}

fn json_column<T: DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn json_column_opt<T: DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<Option<T>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(text) => serde_json::from_str(&text).map(Some).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        }),
        None => Ok(None),
    }
}

fn parse_enum<T: std::str::FromStr>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    text.parse().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unknown value: {}", text).into(),
        )
    })
}

/// Client key as stored: the private key is still encrypted.
pub struct StoredClientKey {
    pub key_id: String,
    pub algorithm: SigningAlgorithm,
    pub private_key_enc: Vec<u8>,
    pub created_at: i64,
}

pub const CLIENT_KEY_COLS: &str = "key_id, algorithm, private_key_enc, created_at";

impl FromRow for StoredClientKey {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(StoredClientKey {
            key_id: row.get(0)?,
            algorithm: parse_enum(row, 1)?,
            private_key_enc: row.get(2)?,
            created_at: row.get(3)?,
        })
    }
}

/// License row without its customer allowances.
pub struct LicenseRow {
    pub license_key: String,
    pub ruleset_ids: std::collections::BTreeSet<String>,
    pub expiration: Option<DateTime<Utc>>,
    pub latest_sync: Option<DateTime<Utc>>,
    pub allowance: Option<AllowanceTerms>,
    pub event_driven: Option<EventDrivenTerms>,
}

pub const LICENSE_COLS: &str =
    "license_key, ruleset_ids, expiration, latest_sync, allowance, event_driven";

impl FromRow for LicenseRow {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(LicenseRow {
            license_key: row.get(0)?,
            ruleset_ids: json_column(row, 1)?,
            expiration: timestamp_opt(row, 2)?,
            latest_sync: timestamp_opt(row, 3)?,
            allowance: json_column_opt(row, 4)?,
            event_driven: json_column_opt(row, 5)?,
        })
    }
}

pub const ALLOWANCE_COLS: &str =
    "customer_id, mode, job_balance, time_range, exhaustion_model, valid_from, version";

impl FromRow for (String, CustomerAllowance) {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok((
            row.get(0)?,
            CustomerAllowance {
                mode: parse_enum(row, 1)?,
                job_balance: row.get(2)?,
                time_range: row.get(3)?,
                exhaustion_model: parse_enum(row, 4)?,
                valid_from: timestamp(row, 5)?,
                version: row.get(6)?,
            },
        ))
    }
}

/// Allowance joined with the owning license's expiration.
pub const LEDGER_ENTRY_COLS: &str = "a.mode, a.job_balance, a.time_range, a.exhaustion_model, \
     a.valid_from, a.version, l.expiration";

impl FromRow for LedgerEntry {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(LedgerEntry {
            allowance: CustomerAllowance {
                mode: parse_enum(row, 0)?,
                job_balance: row.get(1)?,
                time_range: row.get(2)?,
                exhaustion_model: parse_enum(row, 3)?,
                valid_from: timestamp(row, 4)?,
                version: row.get(5)?,
            },
            license_expiration: timestamp_opt(row, 6)?,
        })
    }
}

pub const QUOTA_COLS: &str = "customer_id, cloud, active, quota_minutes, last_execution, \
     consumed_minutes, window_started_at";

impl FromRow for EventDrivenQuota {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(EventDrivenQuota {
            customer_id: row.get(0)?,
            cloud: row.get(1)?,
            active: row.get(2)?,
            quota_minutes: row.get(3)?,
            last_execution: timestamp_opt(row, 4)?,
            consumed_minutes: row.get(5)?,
            window_started_at: timestamp_opt(row, 6)?,
        })
    }
}

pub const RULE_COLS: &str = "rule_id, severity, category, standards, mitre, remediation";

impl FromRow for RuleMetadata {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(RuleMetadata {
            rule_id: row.get(0)?,
            severity: row.get(1)?,
            category: row.get(2)?,
            standards: json_column(row, 3)?,
            mitre: json_column(row, 4)?,
            remediation: row.get(5)?,
        })
    }
}

pub const RULESET_COLS: &str = "ruleset_id, name, version, cloud, rules, license_keys";

impl FromRow for RulesetMetadata {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(RulesetMetadata {
            ruleset_id: row.get(0)?,
            name: row.get(1)?,
            version: row.get(2)?,
            cloud: row.get(3)?,
            rules: json_column(row, 4)?,
            license_keys: json_column(row, 5)?,
        })
    }
}

pub const SYNC_RECORD_COLS: &str =
    "stage, last_attempt_at, succeeded, last_error, last_success_at";

impl FromRow for SyncRecord {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(SyncRecord {
            stage: parse_enum(row, 0)?,
            last_attempt_at: timestamp(row, 1)?,
            succeeded: row.get(2)?,
            last_error: row.get(3)?,
            last_success_at: timestamp_opt(row, 4)?,
        })
    }
}
