use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};

use crate::db::{AppState, queries};
use crate::error::{AppError, Result};
use crate::models::{CustomerRemoval, EventDrivenQuota, License};

pub async fn list_licenses(State(state): State<AppState>) -> Result<Json<Vec<String>>> {
    let conn = state.db.get()?;
    Ok(Json(queries::list_license_keys(&conn)?))
}

pub async fn get_license(
    State(state): State<AppState>,
    Path(license_key): Path<String>,
) -> Result<Json<License>> {
    let conn = state.db.get()?;
    let license = queries::get_license(&conn, &license_key)?
        .ok_or_else(|| AppError::NotFound("License not found".into()))?;
    Ok(Json(license))
}

pub async fn delete_license(
    State(state): State<AppState>,
    Path(license_key): Path<String>,
) -> Result<StatusCode> {
    let conn = state.db.get()?;
    if !queries::delete_license(&conn, &license_key)? {
        return Err(AppError::NotFound("License not found".into()));
    }
    tracing::info!(license_key = %license_key, "license deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// Event-driven quotas of one customer under a license.
pub async fn list_customer_quotas(
    State(state): State<AppState>,
    Path((license_key, customer_id)): Path<(String, String)>,
) -> Result<Json<Vec<EventDrivenQuota>>> {
    let conn = state.db.get()?;
    if queries::get_ledger_entry(&conn, &license_key, &customer_id)?.is_none() {
        return Err(AppError::NotFound("Customer not found".into()));
    }
    Ok(Json(queries::list_event_driven_quotas(
        &conn,
        &license_key,
        &customer_id,
    )?))
}

pub async fn delete_customer(
    State(state): State<AppState>,
    Path(customer_id): Path<String>,
) -> Result<Json<CustomerRemoval>> {
    let mut conn = state.db.get()?;
    let removal = queries::delete_customer(&mut conn, &customer_id)?;
    if removal.allowances == 0 {
        return Err(AppError::NotFound("Customer not found".into()));
    }
    tracing::info!(
        customer_id = %customer_id,
        allowances = removal.allowances,
        licenses = removal.licenses,
        "customer removed"
    );
    Ok(Json(removal))
}
