//! Realtime core error types.
//!
//! Every error carries a stable string code so clients can distinguish
//! "call already ended" from "call not found" from "you are not a
//! participant". Guard failures (`InvalidState`, `PreconditionFailed`) are
//! expected outcomes, not faults; they are returned synchronously and never
//! crash a handler. Internal details are logged server-side, not exposed.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Realtime core error type.
///
/// Maps to HTTP status codes on the admin/health surface:
/// - `Unauthenticated`: 401
/// - `Forbidden`: 403
/// - `NotFound`: 404
/// - `InvalidState`: 409
/// - `PreconditionFailed`: 412
/// - `Unavailable`: 503
/// - `Internal`: 500
#[derive(Debug, Error)]
pub enum CoreError {
    /// No identity attached to the request.
    #[error("Unauthenticated")]
    Unauthenticated,

    /// Identity present but not a participant/owner of the target entity.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Requested transition is not allowed from the current status.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A required precondition is unmet (e.g. both parties online).
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// A downstream collaborator (storage, broker, media provider) failed.
    /// The action is considered not-applied.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Internal error.
    #[error("Internal error")]
    Internal,
}

impl CoreError {
    /// Stable error code for client dispatch.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Unauthenticated => "UNAUTHENTICATED",
            CoreError::Forbidden(_) => "FORBIDDEN",
            CoreError::NotFound(_) => "NOT_FOUND",
            CoreError::InvalidState(_) => "INVALID_STATE",
            CoreError::PreconditionFailed(_) => "PRECONDITION_FAILED",
            CoreError::Unavailable(_) => "UNAVAILABLE",
            CoreError::Internal => "INTERNAL",
        }
    }

    /// HTTP status code for this error.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            CoreError::Unauthenticated => 401,
            CoreError::Forbidden(_) => 403,
            CoreError::NotFound(_) => 404,
            CoreError::InvalidState(_) => 409,
            CoreError::PreconditionFailed(_) => 412,
            CoreError::Unavailable(_) => 503,
            CoreError::Internal => 500,
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        // Log the actual error server-side; the action is not-applied.
        tracing::error!(target: "rt.store", error = %err, "Database operation failed");
        CoreError::Unavailable("storage unavailable".to_string())
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let message = match &self {
            // Never leak downstream details to clients.
            CoreError::Unavailable(reason) => {
                tracing::warn!(target: "rt.availability", reason = %reason, "Service unavailable");
                "Service temporarily unavailable".to_string()
            }
            CoreError::Internal => "An internal error occurred".to_string(),
            other => other.to_string(),
        };

        (
            status,
            Json(ErrorResponse {
                error: ErrorDetail {
                    code: self.code(),
                    message,
                },
            }),
        )
            .into_response()
    }
}
