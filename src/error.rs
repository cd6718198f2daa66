//! Error types for the service
//!
//! Provides unified error handling using thiserror. Store, gateway and queue
//! failures each get their own enum; `AppError` is what HTTP handlers return.

use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::jobs::{JobId, JobState};
use crate::limiter::Decision;

// == Store Error Enum ==
/// Failures of the shared state store.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Store unreachable or refused the operation
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Key or value rejected by the store
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Store is full and eviction failed
    #[error("Store full: {0}")]
    Full(String),

    /// Stored bytes could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        match err.kind() {
            redis::ErrorKind::TypeError => StoreError::Serialization(err.to_string()),
            _ => StoreError::Unavailable(err.to_string()),
        }
    }
}

// == Gateway Error Enum ==
/// Failures of calls to third-party providers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    /// Timeout, transport error, bad status or undecodable body
    #[error("Upstream unavailable: {provider}: {reason}")]
    UpstreamUnavailable {
        provider: &'static str,
        reason: String,
    },

    /// The provider answered that the requested resource does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Caller input that cannot name a provider resource; never sent upstream
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl GatewayError {
    pub(crate) fn unavailable(provider: &'static str, reason: impl ToString) -> Self {
        GatewayError::UpstreamUnavailable {
            provider,
            reason: reason.to_string(),
        }
    }
}

// == Queue Error Enum ==
/// Failures of job queue bookkeeping (not of job handlers).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueueError {
    /// Durable job store failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A transition was attempted from a state that does not allow it
    #[error("Job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobState,
        to: JobState,
    },

    /// Submission rejected before it reached the store
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// Cron expression could not be parsed
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// The lease expired and another worker took the job; the result was discarded
    #[error("Lease on job {0} was lost before its result was recorded")]
    LeaseLost(JobId),
}

// == App Error Enum ==
/// Unified error type returned by HTTP handlers.
#[derive(Error, Debug)]
pub enum AppError {
    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid request data
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Caller lacks the role for this operation
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Caller failed authentication
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Rate limit window exhausted
    #[error("Rate limit exceeded")]
    RateLimited(Decision),

    /// Upstream provider unavailable
    #[error("Service unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::NotFound(what) => AppError::NotFound(what),
            GatewayError::InvalidInput(msg) => AppError::InvalidRequest(msg),
            GatewayError::UpstreamUnavailable { provider, .. } => AppError::UpstreamUnavailable(
                format!("{} service is currently unavailable", provider),
            ),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidRequest(msg) => AppError::InvalidRequest(msg),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::InvalidJob(msg) | QueueError::InvalidSchedule(msg) => {
                AppError::InvalidRequest(msg)
            }
            QueueError::Store(store) => store.into(),
            other => AppError::Internal(other.to_string()),
        }
    }
}

// == IntoResponse Implementation ==
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::RateLimited(decision) => return rate_limited_response(&decision),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::InvalidRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::UpstreamUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

/// Builds the 429 body `{allowed, message, retryAfter}` plus retry headers.
fn rate_limited_response(decision: &Decision) -> Response {
    let body = Json(json!({
        "allowed": false,
        "message": "Too many requests, please try again later.",
        "retryAfter": decision.reset_at_ms,
    }));

    let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
    decision.write_headers(response.headers_mut());
    let retry_secs = decision.retry_after_secs();
    if let Ok(value) = HeaderValue::from_str(&retry_secs.to_string()) {
        response.headers_mut().insert("retry-after", value);
    }
    response
}

// == Result Type Alias ==
/// Convenience Result type for HTTP handlers.
pub type Result<T> = std::result::Result<T, AppError>;
