use std::collections::{BTreeMap, BTreeSet};

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::{Serialize, de::DeserializeOwned};

use crate::crypto::MasterKey;
use crate::error::{AppError, Result};
use crate::jwt::ClientKeyPair;
use crate::models::*;
use crate::util::truncate_to_secs;

use super::from_row::{
    ALLOWANCE_COLS, CLIENT_KEY_COLS, LEDGER_ENTRY_COLS, LICENSE_COLS, LicenseRow, QUOTA_COLS,
    RULE_COLS, RULESET_COLS, SYNC_RECORD_COLS, StoredClientKey, query_all, query_one,
};

fn now() -> i64 {
    Utc::now().timestamp()
}

fn ts(at: Option<DateTime<Utc>>) -> Option<i64> {
    at.map(|t| t.timestamp())
}

// ============ Client Keys ============

/// Register the tenant's client key. The new key replaces any previous one.
pub fn create_client_key(
    conn: &mut Connection,
    input: &CreateClientKey,
    master_key: &MasterKey,
) -> Result<ClientKeyInfo> {
    if input.key_id.trim().is_empty() {
        return Err(AppError::BadRequest("key_id must not be empty".into()));
    }

    let pem = if input.b64_encoded {
        STANDARD
            .decode(input.private_key.trim())
            .map_err(|e| AppError::InvalidKey(format!("key is not valid base64: {}", e)))?
    } else {
        input.private_key.as_bytes().to_vec()
    };

    let derived = ClientKeyPair::from_pem(&pem)?.algorithm();
    if derived != input.algorithm {
        return Err(AppError::BadRequest(format!(
            "key material is a {} key, not {}",
            derived, input.algorithm
        )));
    }

    let encrypted = master_key.encrypt(&input.key_id, &pem)?;
    let created_at = now();

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let replaced = tx.execute("DELETE FROM client_keys", [])?;
    tx.execute(
        "INSERT INTO client_keys (key_id, algorithm, private_key_enc, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![input.key_id, derived.as_ref(), encrypted, created_at],
    )?;
    tx.commit()?;

    if replaced > 0 {
        tracing::info!(key_id = %input.key_id, "client key rotated");
    }

    Ok(ClientKeyInfo {
        key_id: input.key_id.clone(),
        algorithm: derived,
        created_at,
    })
}

/// The active client key with its private key decrypted.
pub fn get_active_client_key(
    conn: &Connection,
    master_key: &MasterKey,
) -> Result<Option<ClientKey>> {
    let stored: Option<StoredClientKey> = query_one(
        conn,
        &format!(
            "SELECT {} FROM client_keys ORDER BY created_at DESC LIMIT 1",
            CLIENT_KEY_COLS
        ),
        &[],
    )?;

    stored
        .map(|key| -> Result<ClientKey> {
            Ok(ClientKey {
                private_key: master_key.decrypt(&key.key_id, &key.private_key_enc)?,
                key_id: key.key_id,
                algorithm: key.algorithm,
                created_at: key.created_at,
            })
        })
        .transpose()
}

/// Encrypted private key of the active client key. Changes on every
/// registration, so callers can tell when a cached key went stale.
pub fn get_active_client_key_ciphertext(conn: &Connection) -> Result<Option<Vec<u8>>> {
    Ok(conn
        .query_row(
            "SELECT private_key_enc FROM client_keys ORDER BY created_at DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?)
}

pub fn get_client_key_info(conn: &Connection, key_id: &str) -> Result<Option<ClientKeyInfo>> {
    let stored: Option<StoredClientKey> = query_one(
        conn,
        &format!("SELECT {} FROM client_keys WHERE key_id = ?1", CLIENT_KEY_COLS),
        &[&key_id],
    )?;
    Ok(stored.map(|key| ClientKeyInfo {
        key_id: key.key_id,
        algorithm: key.algorithm,
        created_at: key.created_at,
    }))
}

pub fn delete_client_key(conn: &Connection, key_id: &str) -> Result<bool> {
    let deleted = conn.execute("DELETE FROM client_keys WHERE key_id = ?1", params![key_id])?;
    Ok(deleted > 0)
}

// ============ Licenses ============

fn allowances_for_license(
    conn: &Connection,
    license_key: &str,
) -> Result<BTreeMap<String, CustomerAllowance>> {
    let rows: Vec<(String, CustomerAllowance)> = query_all(
        conn,
        &format!(
            "SELECT {} FROM customer_allowances WHERE license_key = ?1",
            ALLOWANCE_COLS
        ),
        &[&license_key],
    )?;
    Ok(rows.into_iter().collect())
}

pub fn get_license(conn: &Connection, license_key: &str) -> Result<Option<License>> {
    let row: Option<LicenseRow> = query_one(
        conn,
        &format!("SELECT {} FROM licenses WHERE license_key = ?1", LICENSE_COLS),
        &[&license_key],
    )?;
    let Some(row) = row else {
        return Ok(None);
    };

    Ok(Some(License {
        customers: allowances_for_license(conn, &row.license_key)?,
        license_key: row.license_key,
        ruleset_ids: row.ruleset_ids,
        expiration: row.expiration,
        latest_sync: row.latest_sync,
        allowance: row.allowance,
        event_driven: row.event_driven,
    }))
}

pub fn list_license_keys(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT license_key FROM licenses ORDER BY license_key")?;
    let keys = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(keys)
}

/// Replace the local copy of a license (and its customers and quotas) with
/// what the License Manager published, in one transaction.
///
/// Returns how many rows actually changed, so re-applying the same record is
/// a no-op. Locally tracked usage (event-driven minutes) is kept; job
/// balances come from the License Manager and overwrite local ones.
pub fn apply_license_record(
    conn: &mut Connection,
    record: &LicenseRecord,
    now: DateTime<Utc>,
) -> Result<usize> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut changed = 0;

    let existing: Option<LicenseRow> = query_one(
        &tx,
        &format!("SELECT {} FROM licenses WHERE license_key = ?1", LICENSE_COLS),
        &[&record.license_key],
    )?;

    let expiration = record.expiration.map(truncate_to_secs);
    let ruleset_ids = serde_json::to_string(&record.ruleset_ids)?;
    let allowance = record
        .allowance
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let event_driven = record
        .event_driven
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    match existing {
        None => {
            tx.execute(
                "INSERT INTO licenses (license_key, ruleset_ids, expiration, allowance, event_driven, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![
                    record.license_key,
                    ruleset_ids,
                    ts(expiration),
                    allowance,
                    event_driven,
                    now.timestamp()
                ],
            )?;
            changed += 1;
        }
        Some(row)
            if row.ruleset_ids != record.ruleset_ids
                || row.expiration != expiration
                || row.allowance != record.allowance
                || row.event_driven != record.event_driven =>
        {
            tx.execute(
                "UPDATE licenses SET ruleset_ids = ?2, expiration = ?3, allowance = ?4, event_driven = ?5, updated_at = ?6
                 WHERE license_key = ?1",
                params![
                    record.license_key,
                    ruleset_ids,
                    ts(expiration),
                    allowance,
                    event_driven,
                    now.timestamp()
                ],
            )?;
            changed += 1;
        }
        Some(_) => {}
    }

    let current = allowances_for_license(&tx, &record.license_key)?;

    for customer_id in record.customers.keys() {
        let previous = current.get(customer_id);
        let valid_from = previous.map(|a| a.valid_from).unwrap_or(now);
        let next = record.terms_for(customer_id).to_allowance(valid_from)?;

        match previous {
            Some(prev) if prev.same_terms(&next) => {}
            Some(_) => {
                tx.execute(
                    "UPDATE customer_allowances
                     SET mode = ?3, job_balance = ?4, time_range = ?5, exhaustion_model = ?6,
                         valid_from = ?7, version = version + 1
                     WHERE license_key = ?1 AND customer_id = ?2",
                    params![
                        record.license_key,
                        customer_id,
                        next.mode.as_ref(),
                        next.job_balance,
                        next.time_range,
                        next.exhaustion_model.as_ref(),
                        next.valid_from.timestamp()
                    ],
                )?;
                changed += 1;
            }
            None => {
                tx.execute(
                    "INSERT INTO customer_allowances
                     (license_key, customer_id, mode, job_balance, time_range, exhaustion_model, valid_from)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        record.license_key,
                        customer_id,
                        next.mode.as_ref(),
                        next.job_balance,
                        next.time_range,
                        next.exhaustion_model.as_ref(),
                        next.valid_from.timestamp()
                    ],
                )?;
                changed += 1;
            }
        }
    }

    for customer_id in current.keys() {
        if !record.customers.contains_key(customer_id) {
            changed += tx.execute(
                "DELETE FROM customer_allowances WHERE license_key = ?1 AND customer_id = ?2",
                params![record.license_key, customer_id],
            )?;
        }
    }

    changed += replace_event_driven_quotas(&tx, record)?;

    tx.commit()?;
    Ok(changed)
}

fn replace_event_driven_quotas(conn: &Connection, record: &LicenseRecord) -> Result<usize> {
    let existing: Vec<EventDrivenQuota> = query_all(
        conn,
        &format!(
            "SELECT {} FROM event_driven_quotas WHERE license_key = ?1",
            QUOTA_COLS
        ),
        &[&record.license_key],
    )?;
    let mut wanted: BTreeSet<(&str, &str)> = BTreeSet::new();
    let mut changed = 0;

    if let Some(terms) = &record.event_driven {
        for customer_id in record.customers.keys() {
            for cloud in &terms.clouds {
                wanted.insert((customer_id.as_str(), cloud.as_str()));
                let previous = existing
                    .iter()
                    .find(|q| &q.customer_id == customer_id && &q.cloud == cloud);
                let last_execution = previous
                    .and_then(|q| q.last_execution)
                    .max(terms.last_execution.map(truncate_to_secs));

                match previous {
                    Some(q)
                        if q.active == terms.active
                            && q.quota_minutes == terms.quota_minutes
                            && q.last_execution == last_execution => {}
                    Some(_) => {
                        conn.execute(
                            "UPDATE event_driven_quotas
                             SET active = ?4, quota_minutes = ?5, last_execution = ?6
                             WHERE license_key = ?1 AND customer_id = ?2 AND cloud = ?3",
                            params![
                                record.license_key,
                                customer_id,
                                cloud,
                                terms.active,
                                terms.quota_minutes,
                                ts(last_execution)
                            ],
                        )?;
                        changed += 1;
                    }
                    None => {
                        conn.execute(
                            "INSERT INTO event_driven_quotas
                             (license_key, customer_id, cloud, active, quota_minutes, last_execution)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                            params![
                                record.license_key,
                                customer_id,
                                cloud,
                                terms.active,
                                terms.quota_minutes,
                                ts(last_execution)
                            ],
                        )?;
                        changed += 1;
                    }
                }
            }
        }
    }

    for quota in &existing {
        if !wanted.contains(&(quota.customer_id.as_str(), quota.cloud.as_str())) {
            changed += conn.execute(
                "DELETE FROM event_driven_quotas WHERE license_key = ?1 AND customer_id = ?2 AND cloud = ?3",
                params![record.license_key, quota.customer_id, quota.cloud],
            )?;
        }
    }

    Ok(changed)
}

/// Stamp every license with the completion time of a fully successful sync.
pub fn set_latest_sync(conn: &Connection, at: DateTime<Utc>) -> Result<usize> {
    Ok(conn.execute(
        "UPDATE licenses SET latest_sync = ?1",
        params![at.timestamp()],
    )?)
}

/// Delete a license with its allowances and quotas.
pub fn delete_license(conn: &Connection, license_key: &str) -> Result<bool> {
    let deleted = conn.execute(
        "DELETE FROM licenses WHERE license_key = ?1",
        params![license_key],
    )?;
    Ok(deleted > 0)
}

/// Remove a customer everywhere. Licenses left without any customer go too.
pub fn delete_customer(conn: &mut Connection, customer_id: &str) -> Result<CustomerRemoval> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let license_keys: Vec<String> = {
        let mut stmt =
            tx.prepare("SELECT license_key FROM customer_allowances WHERE customer_id = ?1")?;
        let keys = stmt
            .query_map(params![customer_id], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        keys
    };

    let allowances = tx.execute(
        "DELETE FROM customer_allowances WHERE customer_id = ?1",
        params![customer_id],
    )?;

    let mut licenses = 0;
    for license_key in &license_keys {
        licenses += tx.execute(
            "DELETE FROM licenses WHERE license_key = ?1
             AND NOT EXISTS (SELECT 1 FROM customer_allowances WHERE license_key = ?1)",
            params![license_key],
        )?;
    }

    tx.commit()?;
    Ok(CustomerRemoval {
        allowances,
        licenses,
    })
}

// ============ Ledger ============

pub fn get_ledger_entry(
    conn: &Connection,
    license_key: &str,
    customer_id: &str,
) -> Result<Option<LedgerEntry>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM customer_allowances a
             JOIN licenses l ON l.license_key = a.license_key
             WHERE a.license_key = ?1 AND a.customer_id = ?2",
            LEDGER_ENTRY_COLS
        ),
        &[&license_key, &customer_id],
    )
}

/// Take one job from the balance, provided the allowance is still at
/// `expected_version`. Returns false when someone else got there first.
pub fn try_consume_job(
    conn: &Connection,
    license_key: &str,
    customer_id: &str,
    expected_version: i64,
) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE customer_allowances
         SET job_balance = job_balance - 1, version = version + 1
         WHERE license_key = ?1 AND customer_id = ?2 AND version = ?3
           AND mode = 'JOB_BALANCE' AND job_balance > 0",
        params![license_key, customer_id, expected_version],
    )?;
    Ok(affected > 0)
}

/// Unconditional decrement of a positive job balance.
pub fn decrement_job_balance(
    conn: &Connection,
    license_key: &str,
    customer_id: &str,
) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE customer_allowances
         SET job_balance = job_balance - 1, version = version + 1
         WHERE license_key = ?1 AND customer_id = ?2
           AND mode = 'JOB_BALANCE' AND job_balance > 0",
        params![license_key, customer_id],
    )?;
    Ok(affected > 0)
}

pub fn get_event_driven_quota(
    conn: &Connection,
    license_key: &str,
    customer_id: &str,
    cloud: &str,
) -> Result<Option<EventDrivenQuota>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM event_driven_quotas
             WHERE license_key = ?1 AND customer_id = ?2 AND cloud = ?3",
            QUOTA_COLS
        ),
        &[&license_key, &customer_id, &cloud],
    )
}

pub fn list_event_driven_quotas(
    conn: &Connection,
    license_key: &str,
    customer_id: &str,
) -> Result<Vec<EventDrivenQuota>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM event_driven_quotas
             WHERE license_key = ?1 AND customer_id = ?2 ORDER BY cloud",
            QUOTA_COLS
        ),
        &[&license_key, &customer_id],
    )
}

/// Check and record `minutes` of event-driven usage in one step.
///
/// Returns false (and records nothing) when the quota is missing, inactive,
/// or would be exceeded within the current window.
pub fn try_record_event_driven_usage(
    conn: &mut Connection,
    license_key: &str,
    customer_id: &str,
    cloud: &str,
    minutes: i64,
    now: DateTime<Utc>,
    window: Duration,
) -> Result<bool> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let charged =
        charge_event_driven_minutes(&tx, license_key, customer_id, cloud, minutes, now, window)?;
    if charged {
        tx.commit()?;
    }
    Ok(charged)
}

/// Charge `minutes` to a cloud's quota inside the caller's transaction.
///
/// Returns false, changing nothing, when the quota is missing, inactive, or
/// would be exceeded.
pub fn charge_event_driven_minutes(
    conn: &Connection,
    license_key: &str,
    customer_id: &str,
    cloud: &str,
    minutes: i64,
    now: DateTime<Utc>,
    window: Duration,
) -> Result<bool> {
    let Some(quota) = get_event_driven_quota(conn, license_key, customer_id, cloud)? else {
        return Ok(false);
    };
    if !quota.active {
        return Ok(false);
    }

    let consumed = quota.consumed_at(now, window);
    if consumed + minutes > quota.quota_minutes {
        return Ok(false);
    }

    let window_started_at = match quota.window_started_at {
        Some(start) if now - start < window => start,
        _ => now,
    };

    conn.execute(
        "UPDATE event_driven_quotas
         SET consumed_minutes = ?4, window_started_at = ?5, last_execution = ?6
         WHERE license_key = ?1 AND customer_id = ?2 AND cloud = ?3",
        params![
            license_key,
            customer_id,
            cloud,
            consumed + minutes,
            window_started_at.timestamp(),
            now.timestamp()
        ],
    )?;
    Ok(true)
}

// ============ Rules & Rulesets ============

/// Insert or update a rule. Returns false when the stored copy already matches.
pub fn upsert_rule(conn: &Connection, rule: &RuleMetadata, now: DateTime<Utc>) -> Result<bool> {
    let affected = conn.execute(
        "INSERT INTO rules (rule_id, severity, category, standards, mitre, remediation, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(rule_id) DO UPDATE SET
             severity = excluded.severity, category = excluded.category,
             standards = excluded.standards, mitre = excluded.mitre,
             remediation = excluded.remediation, updated_at = excluded.updated_at
         WHERE rules.severity IS NOT excluded.severity
            OR rules.category IS NOT excluded.category
            OR rules.standards IS NOT excluded.standards
            OR rules.mitre IS NOT excluded.mitre
            OR rules.remediation IS NOT excluded.remediation",
        params![
            rule.rule_id,
            rule.severity,
            rule.category,
            serde_json::to_string(&rule.standards)?,
            serde_json::to_string(&rule.mitre)?,
            rule.remediation,
            now.timestamp()
        ],
    )?;
    Ok(affected > 0)
}

pub fn get_rule(conn: &Connection, rule_id: &str) -> Result<Option<RuleMetadata>> {
    query_one(
        conn,
        &format!("SELECT {} FROM rules WHERE rule_id = ?1", RULE_COLS),
        &[&rule_id],
    )
}

pub fn list_rules(conn: &Connection) -> Result<Vec<RuleMetadata>> {
    query_all(
        conn,
        &format!("SELECT {} FROM rules ORDER BY rule_id", RULE_COLS),
        &[],
    )
}

pub fn upsert_ruleset(
    conn: &Connection,
    ruleset: &RulesetMetadata,
    now: DateTime<Utc>,
) -> Result<bool> {
    let affected = conn.execute(
        "INSERT INTO rulesets (ruleset_id, version, name, cloud, rules, license_keys, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(ruleset_id, version) DO UPDATE SET
             name = excluded.name, cloud = excluded.cloud, rules = excluded.rules,
             license_keys = excluded.license_keys, updated_at = excluded.updated_at
         WHERE rulesets.name IS NOT excluded.name
            OR rulesets.cloud IS NOT excluded.cloud
            OR rulesets.rules IS NOT excluded.rules
            OR rulesets.license_keys IS NOT excluded.license_keys",
        params![
            ruleset.ruleset_id,
            ruleset.version,
            ruleset.name,
            ruleset.cloud,
            serde_json::to_string(&ruleset.rules)?,
            serde_json::to_string(&ruleset.license_keys)?,
            now.timestamp()
        ],
    )?;
    Ok(affected > 0)
}

pub fn list_rulesets(conn: &Connection) -> Result<Vec<RulesetMetadata>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM rulesets ORDER BY ruleset_id, version",
            RULESET_COLS
        ),
        &[],
    )
}

// ============ Sync Records ============

pub fn record_sync_attempt(
    conn: &Connection,
    stage: SyncStage,
    at: DateTime<Utc>,
    error: Option<&str>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_records (stage, last_attempt_at, succeeded, last_error, last_success_at)
         VALUES (?1, ?2, ?3, ?4, CASE WHEN ?3 THEN ?2 END)
         ON CONFLICT(stage) DO UPDATE SET
             last_attempt_at = excluded.last_attempt_at,
             succeeded = excluded.succeeded,
             last_error = excluded.last_error,
             last_success_at = COALESCE(excluded.last_success_at, sync_records.last_success_at)",
        params![stage.as_ref(), at.timestamp(), error.is_none(), error],
    )?;
    Ok(())
}

pub fn list_sync_records(conn: &Connection) -> Result<Vec<SyncRecord>> {
    let mut records: Vec<SyncRecord> = query_all(
        conn,
        &format!("SELECT {} FROM sync_records", SYNC_RECORD_COLS),
        &[],
    )?;
    records.sort_by_key(|r| SyncStage::ALL.iter().position(|s| *s == r.stage));
    Ok(records)
}

// ============ Settings ============

pub fn get_setting<T: DeserializeOwned>(conn: &Connection, key: &str) -> Result<Option<T>> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    value
        .map(|v| serde_json::from_str(&v).map_err(AppError::from))
        .transpose()
}

/// Store a JSON setting. Returns false when the stored value is already equal.
pub fn put_setting<T: Serialize>(conn: &Connection, key: &str, value: &T) -> Result<bool> {
    let affected = conn.execute(
        "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
         WHERE settings.value IS NOT excluded.value",
        params![key, serde_json::to_string(value)?, now()],
    )?;
    Ok(affected > 0)
}

pub fn delete_setting(conn: &Connection, key: &str) -> Result<bool> {
    Ok(conn.execute("DELETE FROM settings WHERE key = ?1", params![key])? > 0)
}
