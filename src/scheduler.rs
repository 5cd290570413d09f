//! Triggers for the periodic sync.
//!
//! Either an in-process timer, or an event rule stored for the deployment to
//! reconcile into its cloud scheduler (which then calls `POST /sync`).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

use crate::db::{DbPool, queries};
use crate::error::{AppError, Result};
use crate::models::SyncOutcome;
use crate::sync::LicenseSyncCoordinator;

#[async_trait]
pub trait JobScheduler: Send + Sync {
    /// Start triggering every `interval`. Enabling a running scheduler updates it.
    async fn enable(&self, interval: Duration) -> Result<()>;

    /// Stop triggering. A pass already running finishes its current stage.
    async fn disable(&self) -> Result<()>;

    async fn update(&self, interval: Duration) -> Result<()>;

    fn is_enabled(&self) -> bool;
}

struct RunningTimer {
    interval_tx: watch::Sender<Duration>,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Tokio timer driving [`LicenseSyncCoordinator::run`].
///
/// Every tick spawns a pass; ticks that land while a pass is still running
/// are skipped by the coordinator.
pub struct IntervalScheduler {
    coordinator: Arc<LicenseSyncCoordinator>,
    running: Mutex<Option<RunningTimer>>,
}

impl IntervalScheduler {
    pub fn new(coordinator: Arc<LicenseSyncCoordinator>) -> Self {
        Self {
            coordinator,
            running: Mutex::new(None),
        }
    }

    fn spawn(&self, interval: Duration) -> RunningTimer {
        let (interval_tx, mut interval_rx) = watch::channel(interval);
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let coordinator = Arc::clone(&self.coordinator);

        let handle = tokio::spawn(async move {
            let mut period = interval;
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        tracing::info!("sync timer stopped");
                        break;
                    }
                    changed = interval_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        period = *interval_rx.borrow_and_update();
                        ticker = interval_at(Instant::now() + period, period);
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                        tracing::info!(interval_secs = period.as_secs(), "sync interval updated");
                    }
                    _ = ticker.tick() => {
                        let coordinator = Arc::clone(&coordinator);
                        let cancel = stop_rx.clone();
                        tokio::spawn(async move {
                            match coordinator.run(Some(&cancel)).await {
                                Ok(SyncOutcome::Skipped) => {
                                    tracing::warn!("previous sync still running, tick skipped");
                                }
                                Ok(SyncOutcome::Completed(_)) => {}
                                Err(e) => tracing::error!(error = %e, "scheduled sync failed"),
                            }
                        });
                    }
                }
            }
        });

        RunningTimer {
            interval_tx,
            stop_tx,
            handle,
        }
    }
}

#[async_trait]
impl JobScheduler for IntervalScheduler {
    async fn enable(&self, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(AppError::BadRequest("sync interval must be positive".into()));
        }
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        match running.as_ref() {
            Some(timer) if !timer.handle.is_finished() => {
                timer.interval_tx.send_replace(interval);
            }
            _ => {
                *running = Some(self.spawn(interval));
                tracing::info!(interval_secs = interval.as_secs(), "sync timer enabled");
            }
        }
        Ok(())
    }

    async fn disable(&self) -> Result<()> {
        let timer = self.running.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(timer) = timer {
            timer.stop_tx.send_replace(true);
        }
        Ok(())
    }

    async fn update(&self, interval: Duration) -> Result<()> {
        if !self.is_enabled() {
            return Err(AppError::NotFound("sync timer is not enabled".into()));
        }
        self.enable(interval).await
    }

    fn is_enabled(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|timer| !timer.handle.is_finished())
    }
}

/// Event rule as persisted for the deployment's rule reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRule {
    pub name: String,
    pub schedule_expression: String,
    pub enabled: bool,
    /// What the rule invokes, e.g. the URL of `POST /sync`
    pub target: String,
}

/// `rate(...)` expression for `interval`, rounded up to whole minutes.
pub fn rate_expression(interval: Duration) -> String {
    let minutes = interval.as_secs().div_ceil(60).max(1);
    match minutes {
        1 => "rate(1 minute)".to_string(),
        1440 => "rate(1 day)".to_string(),
        m if m % 1440 == 0 => format!("rate({} days)", m / 1440),
        60 => "rate(1 hour)".to_string(),
        m if m % 60 == 0 => format!("rate({} hours)", m / 60),
        m => format!("rate({} minutes)", m),
    }
}

pub struct EventRuleScheduler {
    db: DbPool,
    rule_name: String,
    target: String,
}

impl EventRuleScheduler {
    pub fn new(db: DbPool, rule_name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            db,
            rule_name: rule_name.into(),
            target: target.into(),
        }
    }

    fn setting_key(&self) -> String {
        format!("event_rule:{}", self.rule_name)
    }

    pub fn rule(&self) -> Result<Option<EventRule>> {
        let conn = self.db.get()?;
        queries::get_setting(&conn, &self.setting_key())
    }

    fn save(&self, rule: &EventRule) -> Result<()> {
        let conn = self.db.get()?;
        if queries::put_setting(&conn, &self.setting_key(), rule)? {
            tracing::info!(
                rule = %rule.name,
                schedule = %rule.schedule_expression,
                enabled = rule.enabled,
                "event rule saved"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl JobScheduler for EventRuleScheduler {
    async fn enable(&self, interval: Duration) -> Result<()> {
        self.save(&EventRule {
            name: self.rule_name.clone(),
            schedule_expression: rate_expression(interval),
            enabled: true,
            target: self.target.clone(),
        })
    }

    async fn disable(&self) -> Result<()> {
        if let Some(mut rule) = self.rule()? {
            rule.enabled = false;
            self.save(&rule)?;
        }
        Ok(())
    }

    async fn update(&self, interval: Duration) -> Result<()> {
        let mut rule = self
            .rule()?
            .ok_or_else(|| AppError::NotFound(format!("event rule {}", self.rule_name)))?;
        rule.schedule_expression = rate_expression(interval);
        self.save(&rule)
    }

    fn is_enabled(&self) -> bool {
        matches!(self.rule(), Ok(Some(rule)) if rule.enabled)
    }
}
