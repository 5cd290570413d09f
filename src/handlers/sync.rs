use axum::{Json, extract::State};

use crate::db::{AppState, queries};
use crate::error::Result;
use crate::models::{SyncOutcome, SyncRecord};

/// Run a sync pass now. Used by event-rule deployments and operators.
pub async fn trigger_sync(State(state): State<AppState>) -> Result<Json<SyncOutcome>> {
    let outcome = state.coordinator.run(None).await?;
    Ok(Json(outcome))
}

pub async fn sync_status(State(state): State<AppState>) -> Result<Json<Vec<SyncRecord>>> {
    let conn = state.db.get()?;
    Ok(Json(queries::list_sync_records(&conn)?))
}
