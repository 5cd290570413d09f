mod jobs;
mod licenses;
mod rules;
mod sync;

pub use jobs::*;
pub use licenses::*;
pub use rules::*;
pub use sync::*;

use axum::{
    Json, Router,
    routing::{delete, get, post},
};
use serde::Serialize;

use crate::db::AppState;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/jobs/admission", post(admit_job))
        .route("/jobs/admission/event-driven", post(admit_event_driven_job))
        .route("/licenses", get(list_licenses))
        .route(
            "/licenses/{license_key}",
            get(get_license).delete(delete_license),
        )
        .route(
            "/licenses/{license_key}/customers/{customer_id}/quotas",
            get(list_customer_quotas),
        )
        .route("/customers/{customer_id}", delete(delete_customer))
        .route("/rules", get(list_rules))
        .route("/rules/{rule_id}", get(get_rule))
        .route("/rulesets", get(list_rulesets))
        .route("/sync", post(trigger_sync))
        .route("/sync/status", get(sync_status))
        .with_state(state)
}
