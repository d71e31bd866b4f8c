//! Error types for iccid-verifier
//!
//! `VerifyError` is what the engine and the caller-facing operations return;
//! `ApiError` maps it onto HTTP responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use iccid_common::db::BatchState;
use serde_json::json;
use thiserror::Error;

use crate::browser::BrowserError;

/// Typed outcomes of engine and service operations
#[derive(Debug, Error)]
pub enum VerifyError {
    /// No records and no lifecycle row exist under this batch name
    #[error("Batch not found: {0}")]
    BatchNotFound(String),

    /// Starting a run found nothing to verify; no lifecycle row was touched
    #[error("No pending records in batch {0}")]
    NoPendingRecords(String),

    /// Requested lifecycle change is not allowed from the current state
    #[error("Batch {batch} cannot move from {from} to {to}")]
    InvalidTransition {
        batch: String,
        from: BatchState,
        to: BatchState,
    },

    /// Another engine run holds a live claim on the batch
    #[error("Batch {batch} is claimed by another run")]
    AlreadyClaimed { batch: String },

    /// This process already drives (or is finishing) the batch
    #[error("Batch {batch} is already running")]
    AlreadyRunning { batch: String },

    /// The lifecycle row no longer names this run as owner
    #[error("Run lost ownership of batch {0}")]
    OwnershipLost(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Browser automation failure outside the per-record retry path
    #[error("Browser error: {0}")]
    Browser(#[from] BrowserError),

    #[error(transparent)]
    Store(#[from] iccid_common::Error),
}

/// Result type for engine and service operations
pub type VerifyResult<T> = Result<T, VerifyError>;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Conflict (409) - batch claimed, running, or in the wrong state
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),

    /// iccid-common error
    #[error("Common error: {0}")]
    Common(#[from] iccid_common::Error),
}

impl From<VerifyError> for ApiError {
    fn from(err: VerifyError) -> Self {
        match err {
            VerifyError::BatchNotFound(_) => ApiError::NotFound(err.to_string()),
            VerifyError::NoPendingRecords(_) | VerifyError::InvalidInput(_) => {
                ApiError::BadRequest(err.to_string())
            }
            VerifyError::InvalidTransition { .. }
            | VerifyError::AlreadyClaimed { .. }
            | VerifyError::AlreadyRunning { .. }
            | VerifyError::OwnershipLost(_) => ApiError::Conflict(err.to_string()),
            VerifyError::Browser(_) => ApiError::Internal(err.to_string()),
            VerifyError::Store(inner) => match inner {
                iccid_common::Error::NotFound(msg) => ApiError::NotFound(msg),
                iccid_common::Error::InvalidInput(msg) => ApiError::BadRequest(msg),
                other => ApiError::Common(other),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                msg,
            ),
            ApiError::Common(ref err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "COMMON_ERROR",
                err.to_string(),
            ),
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
