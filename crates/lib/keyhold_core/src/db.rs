//! PostgreSQL pool with rotating credentials.
//!
//! The database user and password come from a leased secret. `DbPool` keeps
//! the current `PgPool` behind a lock and swaps in a freshly connected pool
//! whenever the credential lease rotates; in-flight queries finish on the old
//! pool, which is closed in the background.

use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::secrets::cache::SecretCache;
use crate::secrets::{DbCredential, SecretKind};

/// Errors that can occur during database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("Invalid database URL: {0}")]
    InvalidUrl(String),

    #[error("No database credential: {0}")]
    Credential(#[from] crate::secrets::SecretError),
}

/// Result type for database operations.
pub type Result<T> = std::result::Result<T, DbError>;

/// Where to connect; credentials are supplied separately.
#[derive(Debug, Clone)]
pub struct DbSettings {
    /// PostgreSQL URL. Any user or password in it is overridden by the lease.
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl DbSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }

    fn connect_options(&self, credential: &DbCredential) -> Result<PgConnectOptions> {
        let options = PgConnectOptions::from_str(&self.url)
            .map_err(|e| DbError::InvalidUrl(e.to_string()))?;
        Ok(options
            .username(&credential.username)
            .password(&credential.password))
    }
}

/// Handle to the current connection pool.
#[derive(Clone)]
pub struct DbPool {
    settings: DbSettings,
    current: Arc<RwLock<PgPool>>,
}

impl DbPool {
    /// Connect with `credential`.
    pub async fn connect(settings: DbSettings, credential: &DbCredential) -> Result<Self> {
        let pool = open(&settings, credential).await?;
        info!(user = %credential.username, "database pool connected");
        Ok(Self {
            settings,
            current: Arc::new(RwLock::new(pool)),
        })
    }

    /// Wrap an existing pool. Rotation still uses `settings`.
    pub fn from_pool(settings: DbSettings, pool: PgPool) -> Self {
        Self {
            settings,
            current: Arc::new(RwLock::new(pool)),
        }
    }

    /// The pool to run queries on.
    pub fn get(&self) -> PgPool {
        match self.current.read() {
            Ok(pool) => pool.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Connect with a new credential and swap it in.
    ///
    /// On failure the existing pool stays in service.
    pub async fn rotate(&self, credential: &DbCredential) -> Result<()> {
        let pool = open(&self.settings, credential).await?;
        let old = {
            let mut current = match self.current.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::replace(&mut *current, pool)
        };
        info!(user = %credential.username, "database pool rotated");
        tokio::spawn(async move { old.close().await });
        Ok(())
    }

    /// Rebuild the pool every time the db-credential lease rotates.
    pub fn spawn_credential_watcher(
        &self,
        cache: Arc<SecretCache>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let db = self.clone();
        let mut rx = cache.watch(SecretKind::DbCredential);
        rx.mark_unchanged();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                let credential = rx
                    .borrow_and_update()
                    .current
                    .as_ref()
                    .and_then(|lease| lease.db_credential().cloned());
                let Some(credential) = credential else {
                    continue;
                };
                if let Err(e) = db.rotate(&credential).await {
                    warn!(error = %e, "failed to rotate database pool, keeping the old one");
                }
            }
        })
    }

    pub async fn close(&self) {
        self.get().close().await;
    }
}

async fn open(settings: &DbSettings, credential: &DbCredential) -> Result<PgPool> {
    let options = settings.connect_options(credential)?;
    Ok(PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(settings.acquire_timeout)
        .connect_with(options)
        .await?)
}
