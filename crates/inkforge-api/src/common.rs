//! API error translation
//!
//! Maps the runtime error taxonomy onto HTTP status codes and a uniform
//! JSON error body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;

use inkforge_core::{FieldError, RegistryError};
use inkforge_runtime::{ExecutorError, SchedulerError};
use inkforge_storage::StoreError;

/// Error body returned by every failing endpoint
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<FieldError>>,
}

/// API-level error with an HTTP mapping
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid parameters")]
    InvalidParams(Vec<FieldError>),

    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("idempotency key reused with different parameters")]
    IdempotencyConflict,

    #[error("not found")]
    NotFound,

    #[error("task has not completed yet")]
    NotReady,

    #[error("queue backend unavailable")]
    QueueUnavailable,

    #[error("storage error: {0}")]
    Storage(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::InvalidParams(_) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::UnknownWorkflow(_) | Self::NotFound => StatusCode::NOT_FOUND,
            Self::IdempotencyConflict | Self::NotReady => StatusCode::CONFLICT,
            Self::QueueUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::InvalidParams(_) => "InvalidParams",
            Self::UnknownWorkflow(_) => "UnknownWorkflow",
            Self::BadRequest(_) => "InvalidRequest",
            Self::IdempotencyConflict => "IdempotencyConflict",
            Self::NotFound => "NotFound",
            Self::NotReady => "NotReady",
            Self::QueueUnavailable => "QueueUnavailable",
            Self::Storage(_) => "StorageError",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let fields = match &self {
            ApiError::InvalidParams(fields) => Some(fields.clone()),
            _ => None,
        };
        let body = ErrorBody {
            error: self.code(),
            message: self.to_string(),
            fields,
        };

        if self.status().is_server_error() {
            tracing::error!(error = %json!(&body), "request failed");
        }
        (self.status(), Json(body)).into_response()
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownWorkflow(t) => Self::UnknownWorkflow(t),
            RegistryError::InvalidParams(e) => Self::InvalidParams(e.fields),
            other => Self::BadRequest(other.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<ExecutorError> for ApiError {
    fn from(err: ExecutorError) -> Self {
        match err {
            ExecutorError::Registry(e) => e.into(),
            ExecutorError::Storage(e) => e.into(),
            ExecutorError::IdempotencyConflict => Self::IdempotencyConflict,
        }
    }
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::Registry(e) => e.into(),
            SchedulerError::Storage(e) => e.into(),
            SchedulerError::Queue(e) => Self::QueueUnavailable.with_queue_detail(e),
            SchedulerError::QueueUnavailable => Self::QueueUnavailable,
            SchedulerError::InvalidRequest(msg) => Self::BadRequest(msg),
            SchedulerError::IdempotencyConflict => Self::IdempotencyConflict,
        }
    }
}

impl ApiError {
    fn with_queue_detail(self, err: inkforge_runtime::QueueError) -> Self {
        tracing::warn!(error = %err, "queue backend error");
        self
    }
}
