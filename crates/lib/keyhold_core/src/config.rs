//! Library configuration.
//!
//! Plain structs with defaults; the server binary fills them from CLI flags
//! and environment variables.

use std::time::Duration;

use url::Url;

/// Access token lifetime: 15 minutes.
pub const DEFAULT_ACCESS_TOKEN_TTL: Duration = Duration::from_secs(15 * 60);

/// Refresh token lifetime: 30 days, renewed on every rotation.
pub const DEFAULT_REFRESH_TOKEN_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Clock-skew tolerance applied to `exp`.
pub const DEFAULT_LEEWAY_SECS: u64 = 30;

pub const DEFAULT_ISSUER: &str = "keyhold";

/// Token service settings.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// `iss` claim written to and required on access tokens.
    pub issuer: String,
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
    pub leeway_secs: u64,
    /// Absolute URL clients call to refresh, echoed in every token pair.
    pub refresh_link: String,
    /// Give new accounts the `is_default` roles at signup.
    pub auto_assign_default_roles: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            issuer: DEFAULT_ISSUER.into(),
            access_token_ttl: DEFAULT_ACCESS_TOKEN_TTL,
            refresh_token_ttl: DEFAULT_REFRESH_TOKEN_TTL,
            leeway_secs: DEFAULT_LEEWAY_SECS,
            refresh_link: "http://127.0.0.1:3100/api/v1/auth/refresh".into(),
            auto_assign_default_roles: true,
        }
    }
}

impl AuthConfig {
    /// Build the refresh link from the service's public base URL.
    pub fn refresh_link_for(public_base_url: &str) -> String {
        format!(
            "{}/api/v1/auth/refresh",
            public_base_url.trim_end_matches('/')
        )
    }
}

/// Secret cache tuning.
#[derive(Debug, Clone)]
pub struct SecretsConfig {
    /// Upper bound on any single backend call.
    pub backend_timeout: Duration,
    /// Delay between attempts after a failed background refresh.
    pub retry_interval: Duration,
    /// How long a rotated-out signing key still verifies tokens.
    pub signing_key_grace: Duration,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            backend_timeout: Duration::from_secs(5),
            retry_interval: Duration::from_secs(10),
            signing_key_grace: DEFAULT_ACCESS_TOKEN_TTL,
        }
    }
}

/// HashiCorp Vault connection settings.
#[derive(Clone)]
pub struct VaultConfig {
    /// Base URL, e.g. `http://127.0.0.1:8200`.
    pub address: Url,
    pub token: String,
    /// Deployment environment segment of the secret paths.
    pub env: String,
    /// Service segment of the secret paths.
    pub service: String,
}

impl std::fmt::Debug for VaultConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultConfig")
            .field("address", &self.address.as_str())
            .field("env", &self.env)
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}
