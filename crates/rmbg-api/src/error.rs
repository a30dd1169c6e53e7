use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use rmbg_types::{ErrorResponse, QueueError, StoreError};

/// Handler error, rendered as `{error, detail}` JSON.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("task not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Broker(#[from] QueueError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, detail) = match &self {
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "Bad Request", Some(msg.clone())),
            ApiError::NotFound(id) => (
                StatusCode::NOT_FOUND,
                "Not Found",
                Some(format!("Task {} not found", id)),
            ),
            ApiError::Broker(e) => {
                tracing::error!(error = %e, "broker unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Service Unavailable",
                    Some("Job queue is unavailable, retry later".to_string()),
                )
            }
            ApiError::Store(e) => {
                tracing::error!(error = %e, "job store error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error", None)
            }
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error", None)
            }
        };
        let body = ErrorResponse {
            error: error.to_string(),
            detail,
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
