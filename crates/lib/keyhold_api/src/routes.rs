//! Route paths.

pub const API_PREFIX: &str = "/api/v1";

pub const POST_AUTH_LOGIN: &str = "/api/v1/auth/login";
pub const POST_AUTH_REFRESH: &str = "/api/v1/auth/refresh";
pub const POST_AUTH_LOGOUT: &str = "/api/v1/auth/logout";
pub const POST_AUTH_REVOKE: &str = "/api/v1/auth/revoke";
pub const GET_AUTH_KEYS: &str = "/api/v1/auth/keys";

pub const POST_USERS: &str = "/api/v1/users";
/// `GET` reads, `PUT`/`PATCH` update the profile.
pub const USERS_ME: &str = "/api/v1/users/me";
pub const PUT_USERS_ID_ROLES_ROLE: &str = "/api/v1/users/{id}/roles/{role}";
/// `PUT` locks, `DELETE` unlocks.
pub const USERS_ID_LOCK: &str = "/api/v1/users/{id}/lock";

pub const GET_SERVICE_HEALTHCHECK: &str = "/api/v1/service/healthcheck";
