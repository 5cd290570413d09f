use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// One of the four independent synchronization stages, in execution order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SyncStage {
    RuleMetadata,
    License,
    RulesetArtifacts,
    RulesetMetadata,
}

impl SyncStage {
    pub const ALL: [SyncStage; 4] = [
        SyncStage::RuleMetadata,
        SyncStage::License,
        SyncStage::RulesetArtifacts,
        SyncStage::RulesetMetadata,
    ];
}

/// Persisted outcome of the last attempt of a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub stage: SyncStage,
    pub last_attempt_at: DateTime<Utc>,
    pub succeeded: bool,
    pub last_error: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageOutcome {
    pub stage: SyncStage,
    /// Entities written (unchanged entities are not counted)
    pub changed: usize,
    pub error: Option<String>,
}

impl StageOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Summary of one synchronization pass.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub stages: Vec<StageOutcome>,
    /// Set only when every stage succeeded
    pub latest_sync: Option<DateTime<Utc>>,
    pub cancelled: bool,
}

impl SyncReport {
    pub fn all_succeeded(&self) -> bool {
        !self.cancelled
            && self.stages.len() == SyncStage::ALL.len()
            && self.stages.iter().all(StageOutcome::succeeded)
    }

    pub fn stage(&self, stage: SyncStage) -> Option<&StageOutcome> {
        self.stages.iter().find(|s| s.stage == stage)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// A previous pass was still running
    Skipped,
}
