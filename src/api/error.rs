use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::bench::BenchError;
use crate::storage::StoreError;
use crate::tracker::TrackerError;

/// Error type for HTTP handlers, rendered as `{"error", "code"}` JSON.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Bench(#[from] BenchError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0} not found")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::Tracker(TrackerError::NotConfigured(_)) => {
                (StatusCode::BAD_REQUEST, "NOT_CONFIGURED")
            }
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Tracker(TrackerError::UnknownExecution(_)) | ApiError::NotFound(_) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND")
            }
            ApiError::Tracker(TrackerError::AlreadyTracked(_))
            | ApiError::Bench(BenchError::AlreadyRunning) => (StatusCode::CONFLICT, "CONFLICT"),
            ApiError::Tracker(TrackerError::Provider(_)) | ApiError::Bench(BenchError::Provider(_)) => {
                (StatusCode::BAD_GATEWAY, "PROVIDER_ERROR")
            }
            ApiError::Store(StoreError::Duplicate(_))
            | ApiError::Tracker(TrackerError::Store(StoreError::Duplicate(_))) => {
                (StatusCode::CONFLICT, "CONFLICT")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let body = json!({
            "error": self.to_string(),
            "code": code,
        });
        (status, axum::Json(body)).into_response()
    }
}
