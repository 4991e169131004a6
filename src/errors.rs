use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use utoipa::ToSchema;

/// Standard error response body.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Human-readable error message
    pub error: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::ExternalServiceError(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            AppError::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            AppError::DatabaseError(err) => {
                tracing::error!("Database error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal database error".to_string(),
                )
            }
        };

        (status, axum::Json(ErrorResponse { error: message })).into_response()
    }
}

/// Errors from a single upstream polling attempt, internal to the poll loop.
/// Never propagated through axum — consumed by the reconciler and folded
/// into per-cycle aggregate counters.
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("network error fetching run status: {0}")]
    NetworkError(String),

    #[error("upstream returned non-success status {0}")]
    UpstreamStatus(u16),

    #[error("poll cancelled")]
    Cancelled,
}

/// Errors surfaced while reconciling a single classified response against a
/// run row. Like `PollError`, these never escape the poll loop; they drive
/// which error counter a cycle's result descriptor increments.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("store error during reconciliation: {0}")]
    StoreError(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_error_not_found_status() {
        let resp = AppError::NotFound("run 123 not found".to_string()).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_app_error_bad_request_status() {
        let resp = AppError::BadRequest("bad date".to_string()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_app_error_external_service_status() {
        let resp = AppError::ExternalServiceError("upstream down".to_string()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }
}
