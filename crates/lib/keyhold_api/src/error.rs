//! Application error types.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use keyhold_core::auth::AuthError;
use thiserror::Error;
use tracing::error;

use crate::models::ErrorResponse;

/// Convenience alias for handler return types.
pub type AppResult<T> = Result<T, AppError>;

/// Application-level errors with HTTP status mapping.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal server error")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, message) = match &self {
            AppError::Validation(m) => (StatusCode::BAD_REQUEST, "validation_error", m.as_str()),
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, "not_found", m.as_str()),
            AppError::Unauthorized(m) => (StatusCode::UNAUTHORIZED, "unauthorized", m.as_str()),
            AppError::Forbidden(m) => (StatusCode::FORBIDDEN, "forbidden", m.as_str()),
            AppError::Unavailable(m) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", m.as_str())
            }
            AppError::Internal(detail) => {
                error!(%detail, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "Internal server error",
                )
            }
        };
        let body = Json(ErrorResponse {
            error: error.to_string(),
            message: message.to_string(),
        });
        (status, body).into_response()
    }
}

impl From<AuthError> for AppError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::InvalidCredentials | AuthError::UserNotFound => {
                AppError::Unauthorized("Invalid credentials".into())
            }
            AuthError::TokenMalformed
            | AuthError::TokenExpired
            | AuthError::TokenRevoked
            | AuthError::TokenReuseDetected => AppError::Unauthorized(e.to_string()),
            AuthError::AccountLocked
            | AuthError::PermissionDenied(_)
            | AuthError::UserHasNoRole(_) => AppError::Forbidden(e.to_string()),
            AuthError::SecretUnavailable(_) => {
                AppError::Unavailable("Signing keys unavailable".into())
            }
            AuthError::Validation(msg) => AppError::Validation(msg),
            AuthError::UnknownKey(msg) => AppError::Validation(format!("Unknown {msg}")),
            AuthError::Encryption(_) | AuthError::DbError(_) | AuthError::Internal(_) => {
                AppError::Internal(e.to_string())
            }
        }
    }
}
