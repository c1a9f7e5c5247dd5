//! # keyhold_api
//!
//! HTTP API library for Keyhold.

pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post, put};
use keyhold_core::auth::tokens::TokenService;
use tower_http::cors::{Any, CorsLayer};

use crate::config::ApiConfig;
use crate::handlers::{auth, service, users};

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Token service; owns accounts, permissions and the secret cache handle.
    pub tokens: Arc<TokenService>,
    /// API configuration.
    pub config: ApiConfig,
}

/// Builds the Axum router with all routes and shared state.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Public routes (no auth required)
    let public = Router::new()
        .route(routes::GET_SERVICE_HEALTHCHECK, get(service::healthcheck))
        .route(routes::POST_AUTH_LOGIN, post(auth::login_handler))
        .route(routes::POST_AUTH_REFRESH, post(auth::refresh_handler))
        .route(routes::POST_AUTH_LOGOUT, post(auth::logout_handler))
        .route(routes::GET_AUTH_KEYS, get(auth::keys_handler))
        .route(routes::POST_USERS, post(users::register_handler));

    // Protected routes (require auth)
    let protected = Router::new()
        .route(routes::POST_AUTH_REVOKE, post(auth::revoke_handler))
        .route(
            routes::USERS_ME,
            get(users::me_handler)
                .put(users::update_me_handler)
                .patch(users::update_me_handler),
        )
        .route(routes::PUT_USERS_ID_ROLES_ROLE, put(users::assign_role_handler))
        .route(
            routes::USERS_ID_LOCK,
            put(users::lock_handler).delete(users::unlock_handler),
        )
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::require_auth,
        ));

    Router::new()
        .merge(public)
        .merge(protected)
        .layer(cors)
        .with_state(state)
}
