//! Crate-wide error taxonomy.
//!
//! Each variant corresponds to one of the error kinds the gateway's response
//! envelope distinguishes. Components that only need to propagate an error
//! use `anyhow::Result` with `.context(...)`; the gateway's error-mapping
//! layer is the only place that matches on [`AppError`] to choose an HTTP
//! status and redact messages in production mode.

use axum::http::StatusCode;
use serde_json::{json, Value};

/// The error kinds enumerated in the external error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("upstream transient error: {0}")]
    UpstreamTransient(String),

    #[error("upstream permanent error ({status}): {message}")]
    UpstreamPermanent { status: u16, message: String },

    #[error("circuit open for {breaker}, retry after {retry_after_secs}s")]
    CircuitOpen {
        breaker: String,
        retry_after_secs: u64,
    },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::UpstreamTransient(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::UpstreamPermanent { .. } => StatusCode::BAD_GATEWAY,
            AppError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Build the `{success:false, error:{...}}` envelope body.
    ///
    /// When `redact` is set (production mode), `Internal` and
    /// `UpstreamTransient` messages are replaced with a generic phrase —
    /// everything else is already a user-safe, structured message.
    pub fn to_envelope(&self, request_id: &str, redact: bool) -> Value {
        let message = if redact && matches!(self, AppError::Internal(_)) {
            "internal error".to_string()
        } else {
            self.to_string()
        };
        json!({
            "success": false,
            "error": {
                "message": message,
                "requestId": request_id,
                "statusCode": self.status_code().as_u16(),
            }
        })
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            AppError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            AppError::CircuitOpen {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

pub type AppResult<T> = std::result::Result<T, AppError>;
