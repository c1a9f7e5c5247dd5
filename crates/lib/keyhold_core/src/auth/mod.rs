//! Authentication and authorization logic.
//!
//! Provides the encryption gateway, password hashing, the closed role and
//! permission catalog, refresh-token families and the token service that ties
//! them together. Shared by `keyhold_api` and the server binary.

pub mod accounts;
pub mod crypto;
pub mod denylist;
pub mod families;
pub mod jwt;
pub mod password;
pub mod permissions;
pub mod queries;
pub mod store;
pub mod tokens;

use thiserror::Error;

use crate::secrets::SecretError;

/// Authentication errors.
///
/// Messages carry opaque identifiers at most, never token values, passwords
/// or decrypted personal data.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Account locked")]
    AccountLocked,

    #[error("User not found")]
    UserNotFound,

    #[error("User {0} has no role assigned")]
    UserHasNoRole(uuid::Uuid),

    #[error("Token malformed")]
    TokenMalformed,

    #[error("Token expired")]
    TokenExpired,

    #[error("Token revoked")]
    TokenRevoked,

    #[error("Refresh token reuse detected")]
    TokenReuseDetected,

    #[error("Permission denied: {0}")]
    PermissionDenied(permissions::Permission),

    #[error("Secret unavailable: {0}")]
    SecretUnavailable(#[from] SecretError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown catalog key: {0}")]
    UnknownKey(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Database error: {0}")]
    DbError(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuthError {
    /// Whether the error stems from a rejected token rather than a fault.
    pub fn is_token_rejection(&self) -> bool {
        matches!(
            self,
            AuthError::TokenMalformed
                | AuthError::TokenExpired
                | AuthError::TokenRevoked
                | AuthError::TokenReuseDetected
        )
    }
}
