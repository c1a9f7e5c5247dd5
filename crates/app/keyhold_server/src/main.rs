//! Keyhold authorization server binary.
//!
//! Wires the secret cache, the rotating database pool and the token service
//! together and serves the HTTP API until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use keyhold_api::config::ApiConfig;
use keyhold_core::auth::accounts::AccountService;
use keyhold_core::auth::crypto::{EncryptionGateway, FieldKey, LookupKey};
use keyhold_core::auth::denylist::Denylist;
use keyhold_core::auth::queries::{PgCredentialStore, PgFamilyStore, verify_catalog};
use keyhold_core::auth::tokens::TokenService;
use keyhold_core::config::{AuthConfig, DEFAULT_ISSUER, DEFAULT_LEEWAY_SECS, SecretsConfig, VaultConfig};
use keyhold_core::db::{DbPool, DbSettings};
use keyhold_core::secrets::cache::SecretCache;
use keyhold_core::secrets::memory::MemoryBackend;
use keyhold_core::secrets::vault::VaultBackend;
use keyhold_core::secrets::{SecretBackend, SecretKind, SigningMaterial, StaticSecrets};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

/// CLI arguments for the server.
#[derive(Parser, Debug)]
#[command(name = "keyhold_server", about = "Keyhold authorization server")]
struct Args {
    /// Address to bind the HTTP listener.
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:3100")]
    bind_addr: String,

    /// Externally reachable base URL; defaults to `http://{bind_addr}`.
    #[arg(long, env = "PUBLIC_BASE_URL")]
    public_base_url: Option<String>,

    /// PostgreSQL connection URL. With Vault, user and password come from the
    /// database credential lease instead.
    #[arg(
        long,
        env = "DATABASE_URL",
        default_value = "postgres://keyhold@localhost:5432/keyhold"
    )]
    database_url: String,

    /// Maximum number of database connections in the pool.
    #[arg(long, default_value_t = 10)]
    max_connections: u32,

    /// Vault address. Without it secrets are held in memory (development only).
    #[arg(long, env = "VAULT_ADDR")]
    vault_addr: Option<Url>,

    #[arg(long, env = "VAULT_TOKEN", hide_env_values = true)]
    vault_token: Option<String>,

    /// Deployment environment segment of the Vault paths.
    #[arg(long, env = "KEYHOLD_ENV", default_value = "dev")]
    env: String,

    /// Service segment of the Vault paths.
    #[arg(long, env = "KEYHOLD_SERVICE", default_value = "keyhold")]
    service: String,

    #[arg(long, env = "TOKEN_ISSUER", default_value = DEFAULT_ISSUER)]
    issuer: String,

    /// Access token lifetime in seconds.
    #[arg(long, env = "ACCESS_TOKEN_TTL", default_value_t = 15 * 60)]
    access_token_ttl: u64,

    /// Refresh token lifetime in seconds.
    #[arg(long, env = "REFRESH_TOKEN_TTL", default_value_t = 30 * 24 * 60 * 60)]
    refresh_token_ttl: u64,

    /// Give new accounts the default roles at signup.
    #[arg(
        long,
        env = "AUTO_ASSIGN_DEFAULT_ROLES",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    auto_assign_default_roles: bool,

    /// In-memory mode: HS256 signing secret. Random per process when unset.
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,

    /// In-memory mode: base64 field-encryption key (32 bytes).
    #[arg(long, env = "FIELD_KEY", hide_env_values = true)]
    field_key: Option<String>,

    /// In-memory mode: email lookup HMAC key.
    #[arg(long, env = "LOOKUP_KEY", hide_env_values = true)]
    lookup_key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,keyhold_api=debug,keyhold_core=debug")
            }),
        )
        .init();

    let args = Args::parse();
    info!(version = keyhold_core::version(), bind_addr = %args.bind_addr, "starting keyhold_server");

    let access_token_ttl = Duration::from_secs(args.access_token_ttl);
    let backend = secret_backend(&args)?;
    let cache = SecretCache::start(
        backend,
        SecretsConfig {
            signing_key_grace: access_token_ttl,
            ..SecretsConfig::default()
        },
    )
    .await?;

    let credential = cache
        .get_current(SecretKind::DbCredential)?
        .db_credential()
        .cloned()
        .ok_or("database lease carried no credential")?;
    let db = DbPool::connect(
        DbSettings {
            max_connections: args.max_connections,
            ..DbSettings::new(&args.database_url)
        },
        &credential,
    )
    .await?;

    info!("running database migrations");
    keyhold_core::migrate::migrate(&db.get()).await?;
    verify_catalog(&db).await?;

    let cancel = CancellationToken::new();
    let watcher = db.spawn_credential_watcher(Arc::clone(&cache), cancel.clone());

    let api_config = ApiConfig {
        public_base_url: args
            .public_base_url
            .clone()
            .unwrap_or_else(|| format!("http://{}", args.bind_addr)),
        bind_addr: args.bind_addr.clone(),
    };
    let auth_config = AuthConfig {
        issuer: args.issuer.clone(),
        access_token_ttl,
        refresh_token_ttl: Duration::from_secs(args.refresh_token_ttl),
        leeway_secs: DEFAULT_LEEWAY_SECS,
        refresh_link: api_config.refresh_link(),
        auto_assign_default_roles: args.auto_assign_default_roles,
    };

    let statics = cache.static_secrets().clone();
    let accounts = AccountService::new(
        Arc::new(PgCredentialStore::new(db.clone())),
        EncryptionGateway::new(statics.field_key, statics.lookup_key),
        auth_config.auto_assign_default_roles,
    );
    let denylist = Arc::new(Denylist::new());
    let tokens = Arc::new(TokenService::new(
        auth_config,
        accounts,
        Arc::new(PgFamilyStore::new(db.clone())),
        Arc::clone(&denylist),
        Arc::clone(&cache),
    )?);

    let cleanup = denylist.spawn_cleanup_task(cancel.clone());
    let purge = tokens.spawn_purge_task(cancel.clone());

    let app = keyhold_api::router(keyhold_api::AppState {
        tokens,
        config: api_config.clone(),
    });
    let listener = tokio::net::TcpListener::bind(&api_config.bind_addr).await?;
    info!(addr = %listener.local_addr()?, "REST API listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    info!("shutting down");
    cancel.cancel();
    let _ = tokio::join!(watcher, cleanup, purge);
    cache.shutdown().await;
    db.close().await;

    served?;
    Ok(())
}

/// Vault when configured, otherwise an in-memory backend seeded from the
/// command line.
fn secret_backend(args: &Args) -> Result<Arc<dyn SecretBackend>, Box<dyn std::error::Error>> {
    if let Some(address) = &args.vault_addr {
        let token = args
            .vault_token
            .clone()
            .ok_or("VAULT_TOKEN is required with VAULT_ADDR")?;
        info!(%address, env = %args.env, service = %args.service, "using vault secret backend");
        let backend = VaultBackend::new(VaultConfig {
            address: address.clone(),
            token,
            env: args.env.clone(),
            service: args.service.clone(),
        })?;
        return Ok(Arc::new(backend));
    }

    warn!("VAULT_ADDR not set, holding secrets in memory");
    let url = Url::parse(&args.database_url)?;
    let mut backend = MemoryBackend::new()
        .with_db_credential(url.username(), url.password().unwrap_or_default());

    if let Some(secret) = &args.jwt_secret {
        backend = backend.with_signing_key(SigningMaterial::hs256("local", secret.as_bytes()));
    } else {
        warn!("JWT_SECRET not set, tokens will not survive a restart");
    }

    match (&args.field_key, &args.lookup_key) {
        (Some(field_key), Some(lookup_key)) => {
            backend = backend.with_static_secrets(StaticSecrets {
                field_key: FieldKey::from_base64(field_key)?,
                lookup_key: LookupKey::new(lookup_key.as_bytes())?,
            });
        }
        _ => warn!("FIELD_KEY/LOOKUP_KEY not set, stored personal data will be unreadable after a restart"),
    }
    Ok(Arc::new(backend))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
