use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    /// Malformed task at enqueue; rejected, never stored.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Persistent store unreachable. The queue halts claims but no data
    /// is lost; surfaced through the health endpoint.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The worker's lease was reaped or reassigned; execution must abort
    /// without touching queue state.
    #[error("Claim lost")]
    ClaimLost,

    /// Task process exited non-zero or crashed.
    #[error("Executor failure: {message}")]
    ExecutorFailure {
        code: String,
        message: String,
        retryable: bool,
    },

    /// Soft deadline reached.
    #[error("Task timed out: {0}")]
    Timeout(String),

    /// Emitted by the stuck detector; converted to Timeout by the worker
    /// on confirmation.
    #[error("Task stuck: {0}")]
    StuckDetected(String),

    /// Webhook delivery exhausted retries. Never affects task status.
    #[error("Delivery failed: {0}")]
    DeliveryFailure(String),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            AppError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMITED",
                self.to_string(),
            ),
            AppError::Validation(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "VALIDATION_ERROR",
                msg.clone(),
            ),
            AppError::StoreUnavailable(msg) => {
                tracing::error!("Store unavailable: {}", msg);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "STORE_UNAVAILABLE",
                    "Persistent store unreachable".to_string(),
                )
            }
            AppError::ClaimLost => (StatusCode::CONFLICT, "CLAIM_LOST", self.to_string()),
            AppError::ExecutorFailure { message, .. } => {
                tracing::error!("Executor failure: {}", message);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "EXECUTOR_FAILURE",
                    message.clone(),
                )
            }
            AppError::Timeout(msg) => (StatusCode::REQUEST_TIMEOUT, "TIMEOUT", msg.clone()),
            AppError::StuckDetected(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "STUCK_DETECTED",
                msg.clone(),
            ),
            AppError::DeliveryFailure(msg) => {
                tracing::warn!("Webhook delivery failed: {}", msg);
                (StatusCode::BAD_GATEWAY, "DELIVERY_FAILED", msg.clone())
            }
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "A database error occurred".to_string(),
                )
            }
            AppError::Request(e) => {
                tracing::error!("HTTP request error: {:?}", e);
                (
                    StatusCode::BAD_GATEWAY,
                    "EXTERNAL_REQUEST_FAILED",
                    "Failed to communicate with external service".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message,
                details: None,
            },
        };

        (status, Json(body)).into_response()
    }
}

impl AppError {
    /// Whether the failure should re-enter the queue. Only the
    /// executor-facing variants carry a meaningful answer.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::ExecutorFailure { retryable, .. } => *retryable,
            AppError::StoreUnavailable(_) => true,
            _ => false,
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
