pub mod from_row;
pub mod queries;

use std::sync::Arc;
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

use crate::admission::JobAdmissionGate;
use crate::error::Result;
use crate::ledger::LicenseAllowanceLedger;
use crate::sync::LicenseSyncCoordinator;

pub type DbPool = Pool<SqliteConnectionManager>;

#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub ledger: Arc<LicenseAllowanceLedger>,
    pub gate: Arc<JobAdmissionGate>,
    pub coordinator: Arc<LicenseSyncCoordinator>,
}

/// Open a pooled SQLite database with WAL and foreign keys enabled.
pub fn create_pool(path: &str, max_size: u32) -> Result<DbPool> {
    let manager = SqliteConnectionManager::file(path).with_init(|conn| {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
    });
    let pool = Pool::builder().max_size(max_size).build(manager)?;
    init_db(&*pool.get()?)?;
    Ok(pool)
}

pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS client_keys (
            key_id TEXT PRIMARY KEY,
            algorithm TEXT NOT NULL,
            private_key_enc BLOB NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS licenses (
            license_key TEXT PRIMARY KEY,
            ruleset_ids TEXT NOT NULL DEFAULT '[]',
            expiration INTEGER,
            latest_sync INTEGER,
            allowance TEXT,
            event_driven TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS customer_allowances (
            license_key TEXT NOT NULL REFERENCES licenses(license_key) ON DELETE CASCADE,
            customer_id TEXT NOT NULL,
            mode TEXT NOT NULL CHECK (mode IN ('TIME_RANGE', 'JOB_BALANCE', 'UNLIMITED')),
            job_balance INTEGER CHECK (job_balance IS NULL OR job_balance >= 0),
            time_range TEXT,
            exhaustion_model TEXT NOT NULL DEFAULT 'BLOCK',
            valid_from INTEGER NOT NULL,
            version INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (license_key, customer_id)
        );
        CREATE INDEX IF NOT EXISTS idx_customer_allowances_customer ON customer_allowances(customer_id);

        CREATE TABLE IF NOT EXISTS event_driven_quotas (
            license_key TEXT NOT NULL,
            customer_id TEXT NOT NULL,
            cloud TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            quota_minutes INTEGER NOT NULL,
            last_execution INTEGER,
            consumed_minutes INTEGER NOT NULL DEFAULT 0,
            window_started_at INTEGER,
            PRIMARY KEY (license_key, customer_id, cloud),
            FOREIGN KEY (license_key, customer_id)
                REFERENCES customer_allowances(license_key, customer_id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS rules (
            rule_id TEXT PRIMARY KEY,
            severity TEXT NOT NULL,
            category TEXT,
            standards TEXT NOT NULL DEFAULT '{}',
            mitre TEXT NOT NULL DEFAULT '{}',
            remediation TEXT,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS rulesets (
            ruleset_id TEXT NOT NULL,
            version TEXT NOT NULL,
            name TEXT NOT NULL,
            cloud TEXT NOT NULL,
            rules TEXT NOT NULL DEFAULT '[]',
            license_keys TEXT NOT NULL DEFAULT '[]',
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (ruleset_id, version)
        );

        CREATE TABLE IF NOT EXISTS sync_records (
            stage TEXT PRIMARY KEY,
            last_attempt_at INTEGER NOT NULL,
            succeeded INTEGER NOT NULL,
            last_error TEXT,
            last_success_at INTEGER
        );

        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        );
        "#,
    )?;
    Ok(())
}
