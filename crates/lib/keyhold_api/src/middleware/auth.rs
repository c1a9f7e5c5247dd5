//! Authentication middleware: Bearer token extraction and local verification.

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use keyhold_core::auth::permissions::Permission;
use keyhold_core::models::auth::AccessClaims;
use tracing::debug;

use crate::AppState;
use crate::error::{AppError, AppResult};

/// Key used to store verified `AccessClaims` in request extensions.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub AccessClaims);

impl AuthenticatedUser {
    /// 403 unless the token carries `permission`.
    pub fn require_permission(&self, permission: Permission) -> AppResult<()> {
        self.0.require(permission).map_err(|e| {
            debug!(user_id = %self.0.subject, %permission, "permission denied");
            AppError::from(e)
        })
    }
}

/// The `Authorization: Bearer` token, if the header is present at all.
pub fn bearer_token(headers: &HeaderMap) -> AppResult<Option<&str>> {
    let Some(value) = headers.get(AUTHORIZATION) else {
        return Ok(None);
    };
    let header = value
        .to_str()
        .map_err(|_| AppError::Unauthorized("Invalid authorization header".into()))?;
    header
        .strip_prefix("Bearer ")
        .map(Some)
        .ok_or_else(|| AppError::Unauthorized("Invalid authorization scheme".into()))
}

/// Axum middleware: extracts `Authorization: Bearer <token>`, verifies the JWT
/// against the cached keys and the denylist, and injects `AuthenticatedUser`
/// into request extensions.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = bearer_token(request.headers())?
        .ok_or_else(|| AppError::Unauthorized("Missing authorization header".into()))?;

    let claims = state.tokens.verify_access_token(token)?;
    request.extensions_mut().insert(AuthenticatedUser(claims));

    Ok(next.run(request).await)
}
