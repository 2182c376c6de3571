//! Unified error handling with consistent API response envelope.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Error detail in the API response envelope.
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

/// Consistent JSON envelope for all API responses.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub data: Option<T>,
    pub error: Option<ApiError>,
}

impl<T: Serialize> ApiResponse<T> {
    /// Wrap a successful result in the envelope.
    pub fn success(data: T) -> Json<Self> {
        Json(Self {
            data: Some(data),
            error: None,
        })
    }

    /// Wrap an error in the envelope.
    pub fn error(code: &str, message: &str) -> Json<Self> {
        Json(Self {
            data: None,
            error: Some(ApiError {
                code: code.to_string(),
                message: message.to_string(),
            }),
        })
    }
}

/// Application error type covering the pipeline taxonomy and the admin API.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    /// Stale version token on the external blocklist resource. Retried by
    /// the caller's read-modify-write loop before being surfaced.
    #[error("Version conflict on external resource: {0}")]
    Conflict(String),

    /// External resource rate-limited or unreachable after bounded retries.
    #[error("External resource unavailable: {0}")]
    Unavailable(String),

    /// A notification channel failed. Isolated per channel, never fatal.
    #[error("Channel delivery failed: {0}")]
    ChannelFailure(String),

    /// Missing or unusable tenant configuration. The only error that aborts
    /// a tenant's batch.
    #[error("Tenant configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether the blocker/sweeper should retry the external mutation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::Unavailable(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
            }
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            AppError::Unavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "UPSTREAM_UNAVAILABLE",
                msg.clone(),
            ),
            AppError::ChannelFailure(msg) => {
                tracing::warn!(error = %msg, "Channel failure surfaced to API");
                (StatusCode::BAD_GATEWAY, "CHANNEL_FAILURE", msg.clone())
            }
            AppError::Config(msg) => {
                tracing::error!(error = %msg, "Tenant configuration error");
                (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "CONFIG_ERROR",
                    msg.clone(),
                )
            }
            AppError::Database(e) => {
                tracing::error!(error = %e, "Database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = ApiResponse::<()> {
            data: None,
            error: Some(ApiError {
                code: code.to_string(),
                message,
            }),
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_response_success() {
        let response = ApiResponse::success("hello");
        let json = serde_json::to_value(&response.0).unwrap();
        assert_eq!(json["data"], "hello");
        assert!(json["error"].is_null());
    }

    #[test]
    fn api_response_error() {
        let response = ApiResponse::<()>::error("NOT_FOUND", "Block not found");
        let json = serde_json::to_value(&response.0).unwrap();
        assert!(json["data"].is_null());
        assert_eq!(json["error"]["code"], "NOT_FOUND");
        assert_eq!(json["error"]["message"], "Block not found");
    }

    #[test]
    fn conflict_and_unavailable_are_retryable() {
        assert!(AppError::Conflict("stale token".to_string()).is_retryable());
        assert!(AppError::Unavailable("rate limited".to_string()).is_retryable());
        assert!(!AppError::Config("missing tenant".to_string()).is_retryable());
        assert!(!AppError::ChannelFailure("webhook 500".to_string()).is_retryable());
    }

    #[test]
    fn app_error_display() {
        let err = AppError::Validation("source_ip is required".to_string());
        assert_eq!(err.to_string(), "Validation error: source_ip is required");
    }

    #[test]
    fn app_error_from_sqlx() {
        let sqlx_err = sqlx::Error::RowNotFound;
        let err: AppError = sqlx_err.into();
        assert!(matches!(err, AppError::Database(_)));
    }
}
