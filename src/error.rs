use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::models::SyncStage;

#[derive(Debug, Error)]
pub enum AppError {
    // ============ Key management ============
    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("signing failed: {0}")]
    Signing(String),

    // ============ Tokens ============
    #[error("incomplete token: missing {0}")]
    IncompleteToken(&'static str),

    #[error("invalid token signature: {0}")]
    Signature(String),

    #[error("token expired")]
    ExpiredToken,

    #[error("unsupported key type: {0}")]
    UnsupportedKeyType(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("encryption error: {0}")]
    Encryption(String),

    // ============ Licensing ============
    #[error("sync stage {stage} failed: {message}")]
    SyncStage { stage: SyncStage, message: String },

    #[error("license denied: {0}")]
    LicenseDenied(String),

    #[error("concurrent update conflict after {attempts} attempts")]
    ConcurrencyConflict { attempts: u32 },

    #[error("license manager error: {0}")]
    LicenseManager(String),

    // ============ General ============
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl AppError {
    /// Transient failures the caller may resubmit.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::ConcurrencyConflict { .. } | AppError::Http(_) | AppError::Pool(_)
        )
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::LicenseDenied(_) => StatusCode::FORBIDDEN,
            AppError::ConcurrencyConflict { .. } => StatusCode::CONFLICT,
            AppError::NotFound(_) | AppError::KeyNotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_)
            | AppError::UnsupportedKeyType(_)
            | AppError::InvalidKey(_)
            | AppError::IncompleteToken(_) => StatusCode::BAD_REQUEST,
            AppError::Signature(_) | AppError::ExpiredToken => StatusCode::UNAUTHORIZED,
            AppError::LicenseManager(_) | AppError::Http(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
            "internal error".to_string()
        } else {
            self.to_string()
        };

        let body = match &self {
            AppError::LicenseDenied(reason) => json!({
                "error": "license_denied",
                "reason": reason,
            }),
            _ => json!({ "error": message }),
        };

        (status, Json(body)).into_response()
    }
}
