use axum::{Json, extract::State, extract::rejection::JsonRejection};

use crate::admission::{Admission, AdmissionRequest, EventDrivenAdmission, EventDrivenRequest};
use crate::db::AppState;
use crate::error::{AppError, Result};

pub async fn admit_job(
    State(state): State<AppState>,
    payload: std::result::Result<Json<AdmissionRequest>, JsonRejection>,
) -> Result<Json<Admission>> {
    let Json(input) = payload?;
    let admission = state
        .gate
        .admit(&input.customer_id, &input.license_key)
        .await?;
    Ok(Json(admission))
}

pub async fn admit_event_driven_job(
    State(state): State<AppState>,
    payload: std::result::Result<Json<EventDrivenRequest>, JsonRejection>,
) -> Result<Json<EventDrivenAdmission>> {
    let Json(input) = payload?;
    if input.clouds.is_empty() {
        return Err(AppError::BadRequest("clouds must not be empty".into()));
    }
    let admission = state.gate.admit_event_driven(&input).await?;
    Ok(Json(admission))
}
