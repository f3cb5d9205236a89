//! Common error types for the toolkit gateway

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::job::classify::FailureClass;
use crate::job::model::{JobStatus, VendorId};

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Insufficient credits: {required} required, {available} available")]
    InsufficientCredits { required: u32, available: u32 },

    #[error("{vendor} rejected job submission with status {status}: {body}")]
    VendorSubmission {
        vendor: VendorId,
        status: u16,
        body: String,
    },

    #[error("Job {job_id} did not finish within {waited:?}")]
    PollTimeout { job_id: String, waited: Duration },

    #[error("Job {job_id} ended as {status}: {message}")]
    VendorFailure {
        job_id: String,
        status: JobStatus,
        class: FailureClass,
        message: String,
    },

    #[error("Asset relocation failed for {source_url}: {reason}")]
    Relocation { source_url: String, reason: String },

    #[error("Object already exists: {0}")]
    StorageConflict(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Invalid job transition for {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("All {failed} batch items failed; first error: {first_error}")]
    BatchFailed { failed: usize, first_error: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Short machine-readable code, also used for per-item batch failures
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Config(_) => "config_error",
            AppError::Io(_) => "io_error",
            AppError::Json(_) => "invalid_json",
            AppError::HttpClient(_) => "http_client_error",
            AppError::AuthenticationFailed(_) => "invalid_api_key",
            AppError::InvalidRequest(_) => "invalid_request",
            AppError::InsufficientCredits { .. } => "insufficient_credits",
            AppError::VendorSubmission { .. } => "vendor_submission_failed",
            AppError::PollTimeout { .. } => "poll_timeout",
            AppError::VendorFailure { class, .. } => class.as_str(),
            AppError::Relocation { .. } => "relocation_failed",
            AppError::StorageConflict(_) => "storage_conflict",
            AppError::Storage(_) => "storage_error",
            AppError::Persistence(_) => "persistence_error",
            AppError::InvalidTransition { .. } => "invalid_transition",
            AppError::BatchFailed { .. } => "batch_failed",
            AppError::NotFound(_) => "not_found",
            AppError::Internal(_) => "internal_error",
        }
    }
}

/// Error response format: `{ "success": false, "error": { ... } }`
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub message: String,
    pub r#type: String,
    pub code: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            AppError::Config(_) | AppError::Io(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "server_error")
            }
            AppError::Json(_) => (StatusCode::BAD_REQUEST, "invalid_request_error"),
            AppError::HttpClient(_) => (StatusCode::BAD_GATEWAY, "vendor_error"),
            AppError::AuthenticationFailed(_) => {
                (StatusCode::UNAUTHORIZED, "authentication_error")
            }
            AppError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request_error"),
            AppError::InsufficientCredits { .. } => (StatusCode::PAYMENT_REQUIRED, "credit_error"),
            AppError::VendorSubmission { .. } => (StatusCode::BAD_GATEWAY, "vendor_error"),
            AppError::PollTimeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "timeout_error"),
            AppError::VendorFailure { class, .. } => match class {
                FailureClass::InvalidInput | FailureClass::ContentPolicy => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "vendor_error")
                }
                FailureClass::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "vendor_error"),
                FailureClass::Unknown => (StatusCode::BAD_GATEWAY, "vendor_error"),
            },
            AppError::Relocation { .. } => (StatusCode::BAD_GATEWAY, "storage_error"),
            AppError::StorageConflict(_) => (StatusCode::CONFLICT, "storage_error"),
            AppError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
            AppError::Persistence(_) => (StatusCode::INTERNAL_SERVER_ERROR, "server_error"),
            AppError::InvalidTransition { .. } => (StatusCode::CONFLICT, "server_error"),
            AppError::BatchFailed { .. } => (StatusCode::BAD_GATEWAY, "vendor_error"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found_error"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "server_error"),
        };

        let body = Json(ErrorResponse {
            success: false,
            error: ErrorDetail {
                message: self.to_string(),
                r#type: error_type.to_string(),
                code: self.code().to_string(),
            },
        });

        (status, body).into_response()
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, AppError>;
