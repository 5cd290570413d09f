//! Periodic pull of rules, licenses and rulesets from the License Manager.
//!
//! A pass runs four independent stages in a fixed order. A failing stage is
//! recorded and the pass moves on; `latest_sync` only advances when every
//! stage succeeded. Re-running a pass against unchanged upstream data writes
//! nothing.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, watch};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::crypto::sha256_hex;
use crate::db::{DbPool, queries};
use crate::error::{AppError, Result};
use crate::jwt::TokenIssuer;
use crate::license_manager::LicenseManagerApi;
use crate::models::{StageOutcome, SyncOutcome, SyncReport, SyncStage};
use crate::storage::ObjectStore;
use crate::util::Clock;

/// Settings key holding the decrypted secret of a license.
pub fn license_secret_key(license_key: &str) -> String {
    format!("license_secret:{}", license_key)
}

pub struct LicenseSyncCoordinator {
    api: Arc<dyn LicenseManagerApi>,
    issuer: Arc<TokenIssuer>,
    db: DbPool,
    objects: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    running: Mutex<()>,
}

impl LicenseSyncCoordinator {
    pub fn new(
        api: Arc<dyn LicenseManagerApi>,
        issuer: Arc<TokenIssuer>,
        db: DbPool,
        objects: Arc<dyn ObjectStore>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        Self {
            api,
            issuer,
            db,
            objects,
            clock,
            config,
            running: Mutex::new(()),
        }
    }

    pub fn interval(&self) -> std::time::Duration {
        self.config.interval
    }

    /// Run one synchronization pass.
    ///
    /// Returns [`SyncOutcome::Skipped`] if a pass is already running. When
    /// `cancel` flips to true the pass stops before the next stage.
    pub async fn run(&self, cancel: Option<&watch::Receiver<bool>>) -> Result<SyncOutcome> {
        let Ok(_guard) = self.running.try_lock() else {
            tracing::warn!("sync already in progress, skipping");
            return Ok(SyncOutcome::Skipped);
        };

        let run_id = Uuid::new_v4();
        let started_at = self.clock.now();
        tracing::info!(%run_id, tenant_id = %self.config.tenant_id, "sync started");

        let token = self
            .issuer
            .bearer_token(&self.config.tenant_id, self.config.token_lifetime, started_at)
            .await
            .inspect_err(|e| tracing::error!(error = %e, "could not sign sync token"))?;

        let mut report = SyncReport {
            run_id,
            started_at,
            stages: Vec::with_capacity(SyncStage::ALL.len()),
            latest_sync: None,
            cancelled: false,
        };

        for stage in SyncStage::ALL {
            if cancel.is_some_and(|rx| *rx.borrow()) {
                tracing::info!(%run_id, %stage, "sync cancelled before stage");
                report.cancelled = true;
                break;
            }

            let result = match stage {
                SyncStage::RuleMetadata => self.sync_rule_metadata(&token).await,
                SyncStage::License => self.sync_licenses(&token).await,
                SyncStage::RulesetArtifacts => self.sync_ruleset_artifacts(&token).await,
                SyncStage::RulesetMetadata => self.sync_ruleset_metadata(&token).await,
            };

            let outcome = match result {
                Ok(changed) => {
                    tracing::info!(%run_id, %stage, changed, "sync stage completed");
                    StageOutcome {
                        stage,
                        changed,
                        error: None,
                    }
                }
                Err(e) => {
                    let e = AppError::SyncStage {
                        stage,
                        message: e.to_string(),
                    };
                    tracing::error!(%run_id, error = %e, "sync stage failed");
                    StageOutcome {
                        stage,
                        changed: 0,
                        error: Some(e.to_string()),
                    }
                }
            };

            let conn = self.db.get()?;
            queries::record_sync_attempt(&conn, stage, self.clock.now(), outcome.error.as_deref())?;
            report.stages.push(outcome);
        }

        if report.all_succeeded() {
            let conn = self.db.get()?;
            queries::set_latest_sync(&conn, started_at)?;
            report.latest_sync = Some(started_at);
            tracing::info!(%run_id, latest_sync = %started_at, "sync completed");
        } else {
            tracing::warn!(
                %run_id,
                cancelled = report.cancelled,
                "sync incomplete, latest_sync not advanced"
            );
        }

        Ok(SyncOutcome::Completed(report))
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn sync_rule_metadata(&self, token: &str) -> Result<usize> {
        let rules = self.api.fetch_rule_metadata(token).await?;
        let conn = self.db.get()?;
        let now = self.now();
        let mut changed = 0;
        for rule in &rules {
            if queries::upsert_rule(&conn, rule, now)? {
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn sync_licenses(&self, token: &str) -> Result<usize> {
        let records = self.api.fetch_licenses(token).await?;
        let mut conn = self.db.get()?;
        let now = self.now();
        let mut changed = 0;

        for record in &records {
            changed += queries::apply_license_record(&mut conn, record, now)?;

            let Some(secret) = record.secret.as_deref() else {
                continue;
            };
            match self.issuer.local_client()? {
                Some(client) => {
                    let decrypted = client.decrypt(secret)?;
                    if queries::put_setting(
                        &conn,
                        &license_secret_key(&record.license_key),
                        &decrypted,
                    )? {
                        changed += 1;
                    }
                }
                None => tracing::warn!(
                    license_key = %record.license_key,
                    "license secret needs a locally held client key, skipping"
                ),
            }
        }

        Ok(changed)
    }

    async fn sync_ruleset_artifacts(&self, token: &str) -> Result<usize> {
        let artifacts = self.api.list_ruleset_artifacts(token).await?;
        let mut changed = 0;

        for artifact in &artifacts {
            let key = artifact.object_key();
            let existing = self.objects.get(&key).await?;

            if let (Some(stored), Some(expected)) = (&existing, &artifact.sha256)
                && sha256_hex(stored).eq_ignore_ascii_case(expected)
            {
                continue;
            }

            let content = self.api.download_artifact(token, artifact).await?;
            if let Some(expected) = &artifact.sha256
                && !sha256_hex(&content).eq_ignore_ascii_case(expected)
            {
                return Err(AppError::LicenseManager(format!(
                    "artifact {} failed its checksum",
                    key
                )));
            }
            if existing.as_deref() == Some(content.as_slice()) {
                continue;
            }

            self.objects.put(&key, &content).await?;
            tracing::debug!(key = %key, bytes = content.len(), "ruleset artifact stored");
            changed += 1;
        }

        Ok(changed)
    }

    async fn sync_ruleset_metadata(&self, token: &str) -> Result<usize> {
        let rulesets = self.api.fetch_ruleset_metadata(token).await?;
        let conn = self.db.get()?;
        let now = self.now();
        let mut changed = 0;
        for ruleset in &rulesets {
            if queries::upsert_ruleset(&conn, ruleset, now)? {
                changed += 1;
            }
        }
        Ok(changed)
    }
}
