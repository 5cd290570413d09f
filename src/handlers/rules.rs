use axum::{
    Json,
    extract::{Path, State},
};

use crate::db::{AppState, queries};
use crate::error::{AppError, Result};
use crate::models::{RuleMetadata, RulesetMetadata};

pub async fn list_rules(State(state): State<AppState>) -> Result<Json<Vec<RuleMetadata>>> {
    let conn = state.db.get()?;
    Ok(Json(queries::list_rules(&conn)?))
}

pub async fn get_rule(
    State(state): State<AppState>,
    Path(rule_id): Path<String>,
) -> Result<Json<RuleMetadata>> {
    let conn = state.db.get()?;
    let rule = queries::get_rule(&conn, &rule_id)?
        .ok_or_else(|| AppError::NotFound("Rule not found".into()))?;
    Ok(Json(rule))
}

pub async fn list_rulesets(State(state): State<AppState>) -> Result<Json<Vec<RulesetMetadata>>> {
    let conn = state.db.get()?;
    Ok(Json(queries::list_rulesets(&conn)?))
}
