//! Token request handlers.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::{Extension, Json};
use keyhold_core::auth::permissions::Permission;
use keyhold_core::auth::tokens::RevokeTarget;
use keyhold_core::models::auth::TokenPair;
use tracing::debug;

use crate::AppState;
use crate::error::{AppError, AppResult};
use crate::middleware::auth::{AuthenticatedUser, bearer_token};
use crate::models::{KeysResponse, LoginRequest, OkResponse, RefreshRequest, RevokeRequest};

/// `POST /auth/login`: authenticate with email + password.
pub async fn login_handler(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> AppResult<Json<TokenPair>> {
    let pair = state.tokens.login(&body.email, &body.password).await?;
    Ok(Json(pair))
}

/// `POST /auth/refresh`: exchange a refresh token for the next pair.
pub async fn refresh_handler(
    State(state): State<AppState>,
    Json(body): Json<RefreshRequest>,
) -> AppResult<Json<TokenPair>> {
    let pair = state.tokens.refresh_token_pair(&body.refresh_token).await?;
    Ok(Json(pair))
}

/// `POST /auth/logout`: revoke the family of a refresh token. A bearer access
/// token sent along is denied until it would have expired.
pub async fn logout_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RefreshRequest>,
) -> AppResult<Json<OkResponse>> {
    let access = match bearer_token(&headers)? {
        Some(token) => match state.tokens.verify_access_token(token) {
            Ok(claims) => Some(claims),
            // Already unusable; the refresh token still ends the session.
            Err(e) if e.is_token_rejection() => {
                debug!(error = %e, "ignoring rejected bearer on logout");
                None
            }
            Err(e) => return Err(e.into()),
        },
        None => None,
    };
    state
        .tokens
        .logout(&body.refresh_token, access.as_ref())
        .await?;
    Ok(Json(OkResponse::ok()))
}

/// `POST /auth/revoke`: revoke an access token or a family. Requires
/// `manage_users`.
pub async fn revoke_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(body): Json<RevokeRequest>,
) -> AppResult<Json<OkResponse>> {
    user.require_permission(Permission::ManageUsers)?;
    let target = match (body.token_id, body.family_id) {
        (Some(token_id), None) => RevokeTarget::Token(token_id),
        (None, Some(family_id)) => RevokeTarget::Family(family_id),
        _ => {
            return Err(AppError::Validation(
                "Exactly one of token_id or family_id is required".into(),
            ));
        }
    };
    state.tokens.revoke(target).await?;
    Ok(Json(OkResponse::ok()))
}

/// `GET /auth/keys`: verification keys for services validating tokens.
pub async fn keys_handler(State(state): State<AppState>) -> Json<KeysResponse> {
    Json(KeysResponse {
        keys: state.tokens.published_keys(),
    })
}
