use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::domain::DomainError;
use serde_json::json;

/// HTTP status and client-facing message for a domain error.
///
/// Internal failures are logged here and reported with a generic message.
pub fn domain_error_to_response(error: &DomainError) -> (StatusCode, String) {
    match error {
        DomainError::MissingHeader(_)
        | DomainError::InvalidJson(_)
        | DomainError::SchemaViolation(_)
        | DomainError::DeviceIdMismatch { .. }
        | DomainError::InvalidQuery(_) => (StatusCode::BAD_REQUEST, error.to_string()),

        DomainError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
        DomainError::ReplayRejected(_) => (
            StatusCode::UNAUTHORIZED,
            "Timestamp outside replay window".to_string(),
        ),
        DomainError::SignatureMismatch => {
            (StatusCode::UNAUTHORIZED, "Invalid signature".to_string())
        }
        DomainError::UnknownDevice(_) => {
            (StatusCode::UNAUTHORIZED, "Unknown device ID".to_string())
        }

        DomainError::QueueUnavailable(_) => (
            StatusCode::BAD_GATEWAY,
            "Queue temporarily unavailable, retry later".to_string(),
        ),

        DomainError::Timeout(operation) => (
            StatusCode::GATEWAY_TIMEOUT,
            format!("Timed out waiting for {}", operation),
        ),

        DomainError::WorkerUnavailable => (StatusCode::CONFLICT, error.to_string()),

        DomainError::SinkWrite(_) | DomainError::Crypto(_) | DomainError::RepositoryError(_) => {
            tracing::error!(error = %error, "internal error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            )
        }
    }
}

/// Handler error wrapper so `?` works on `DomainResult` inside handlers.
#[derive(Debug)]
pub struct ApiError(pub DomainError);

impl From<DomainError> for ApiError {
    fn from(error: DomainError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = domain_error_to_response(&self.0);
        (status, Json(json!({ "error": message }))).into_response()
    }
}
