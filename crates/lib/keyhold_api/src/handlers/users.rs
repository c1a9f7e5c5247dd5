//! Account handlers.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use keyhold_core::auth::AuthError;
use keyhold_core::auth::permissions::{Permission, Role};
use keyhold_core::models::auth::{NewAccount, Profile, ProfileUpdate};
use uuid::Uuid;

use crate::AppState;
use crate::error::{AppError, AppResult};
use crate::middleware::auth::AuthenticatedUser;
use crate::models::OkResponse;

/// On admin routes an unknown target user is a plain 404.
fn target_error(user_id: Uuid) -> impl FnOnce(AuthError) -> AppError {
    move |e| match e {
        AuthError::UserNotFound => AppError::NotFound(format!("user {user_id}")),
        other => AppError::from(other),
    }
}

/// `POST /users`: sign up.
pub async fn register_handler(
    State(state): State<AppState>,
    Json(body): Json<NewAccount>,
) -> AppResult<(StatusCode, Json<Profile>)> {
    let accounts = state.tokens.accounts();
    let user_id = accounts.register(body).await?;
    let profile = accounts.profile(user_id).await?;
    Ok((StatusCode::CREATED, Json(profile)))
}

/// `GET /users/me`: profile of the token's subject.
pub async fn me_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> AppResult<Json<Profile>> {
    let profile = state.tokens.accounts().profile(user.0.subject).await?;
    Ok(Json(profile))
}

/// `PUT`/`PATCH /users/me`: change the subject's names or phone.
pub async fn update_me_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(body): Json<ProfileUpdate>,
) -> AppResult<Json<Profile>> {
    let profile = state
        .tokens
        .accounts()
        .update_profile(user.0.subject, body)
        .await?;
    Ok(Json(profile))
}

/// `PUT /users/{id}/roles/{role}`: grant a role. Takes effect on the
/// holder's next issuance or refresh.
pub async fn assign_role_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path((user_id, role)): Path<(Uuid, String)>,
) -> AppResult<Json<Profile>> {
    user.require_permission(Permission::ManageUsers)?;
    let role: Role = role.parse()?;
    let accounts = state.tokens.accounts();
    accounts
        .assign_role(user_id, role)
        .await
        .map_err(target_error(user_id))?;
    let profile = accounts
        .profile(user_id)
        .await
        .map_err(target_error(user_id))?;
    Ok(Json(profile))
}

/// `PUT /users/{id}/lock`: lock an account and end its sessions.
pub async fn lock_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(user_id): Path<Uuid>,
) -> AppResult<Json<OkResponse>> {
    user.require_permission(Permission::ManageUsers)?;
    state
        .tokens
        .set_locked(user_id, true)
        .await
        .map_err(target_error(user_id))?;
    Ok(Json(OkResponse::ok()))
}

/// `DELETE /users/{id}/lock`: unlock an account.
pub async fn unlock_handler(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(user_id): Path<Uuid>,
) -> AppResult<Json<OkResponse>> {
    user.require_permission(Permission::ManageUsers)?;
    state
        .tokens
        .set_locked(user_id, false)
        .await
        .map_err(target_error(user_id))?;
    Ok(Json(OkResponse::ok()))
}
