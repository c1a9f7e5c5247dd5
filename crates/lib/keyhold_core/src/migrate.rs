//! Database migration support.
//!
//! Embeds and runs SQL migrations from `keyhold_core/migrations/`, including
//! the seeded role/permission catalog.

use sqlx::PgPool;

/// Run all embedded database migrations against the given pool.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
