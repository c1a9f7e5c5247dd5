//! HashiCorp Vault secret backend.
//!
//! Paths, relative to the configured address:
//!
//! | Secret | Request |
//! |---|---|
//! | static secrets | `GET /v1/kv/{env}/{service}` |
//! | db credential | `GET /v1/database/{env}/roles/{service}` |
//! | signing key | `GET /v1/keys/{env}/{service}` |
//! | lease revocation | `PUT /v1/sys/leases/revoke` |

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::debug;

use super::{
    DbCredential, SecretBackend, SecretError, SecretKind, SecretLease, SecretMaterial,
    SigningMaterial, StaticSecrets,
};
use crate::config::VaultConfig;

/// Upper bound on a single HTTP exchange; the cache applies its own, tighter one.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Lease response envelope.
#[derive(Debug, Deserialize)]
struct LeaseResponse {
    #[serde(default)]
    lease_id: String,
    #[serde(default)]
    lease_duration: u64,
    data: serde_json::Value,
}

/// Vault client for leased and static secrets.
#[derive(Clone)]
pub struct VaultBackend {
    config: VaultConfig,
    http_client: Client,
}

impl VaultBackend {
    pub fn new(config: VaultConfig) -> Result<Self, SecretError> {
        let http_client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| SecretError::Backend(format!("creating HTTP client: {e}")))?;
        debug!(address = %config.address, env = %config.env, service = %config.service, "vault backend initialized");
        Ok(Self {
            config,
            http_client,
        })
    }

    fn url(&self, path: &str) -> Result<url::Url, SecretError> {
        self.config
            .address
            .join(path)
            .map_err(|e| SecretError::Backend(format!("invalid vault path {path}: {e}")))
    }

    fn lease_path(&self, kind: SecretKind) -> String {
        let VaultConfig { env, service, .. } = &self.config;
        match kind {
            SecretKind::SigningKey => format!("v1/keys/{env}/{service}"),
            SecretKind::DbCredential => format!("v1/database/{env}/roles/{service}"),
        }
    }

    async fn get(&self, path: &str) -> Result<LeaseResponse, SecretError> {
        let url = self.url(path)?;
        debug!(path, "reading from vault");
        let response = self
            .http_client
            .get(url)
            .header("X-Vault-Token", &self.config.token)
            .send()
            .await
            .map_err(|e| SecretError::Backend(format!("vault request: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SecretError::Backend(format!(
                "vault read {path} failed with status {status}"
            )));
        }
        response
            .json()
            .await
            .map_err(|e| SecretError::Malformed(format!("vault response: {e}")))
    }
}

/// KV v2 nests the payload one level deeper than KV v1.
fn kv_payload(data: serde_json::Value) -> serde_json::Value {
    match data {
        serde_json::Value::Object(mut map)
            if map.contains_key("metadata") && map.get("data").is_some_and(|d| d.is_object()) =>
        {
            map.remove("data").unwrap_or_default()
        }
        other => other,
    }
}

fn parse_lease(kind: SecretKind, response: LeaseResponse) -> Result<SecretLease, SecretError> {
    if response.lease_id.is_empty() || response.lease_duration == 0 {
        return Err(SecretError::Malformed(format!(
            "{kind} response carries no lease"
        )));
    }
    let material = match kind {
        SecretKind::SigningKey => {
            SecretMaterial::Signing(SigningMaterial::from_json(kv_payload(response.data))?)
        }
        SecretKind::DbCredential => SecretMaterial::Database(
            serde_json::from_value::<DbCredential>(response.data)
                .map_err(|e| SecretError::Malformed(format!("db credential: {e}")))?,
        ),
    };
    Ok(SecretLease {
        lease_id: response.lease_id,
        kind,
        material,
        obtained_at: Instant::now(),
        obtained_at_utc: Utc::now(),
        ttl: Duration::from_secs(response.lease_duration),
    })
}

#[async_trait]
impl SecretBackend for VaultBackend {
    async fn read_static(&self) -> Result<StaticSecrets, SecretError> {
        let VaultConfig { env, service, .. } = &self.config;
        let response = self.get(&format!("v1/kv/{env}/{service}")).await?;
        StaticSecrets::from_json(kv_payload(response.data))
    }

    async fn lease(&self, kind: SecretKind) -> Result<SecretLease, SecretError> {
        // Timestamp before the request so ttl never overstates what is left.
        let requested_at = Instant::now();
        let requested_at_utc = Utc::now();
        let response = self.get(&self.lease_path(kind)).await?;
        let mut lease = parse_lease(kind, response)?;
        lease.obtained_at = requested_at;
        lease.obtained_at_utc = requested_at_utc;
        debug!(%kind, lease_id = %lease.lease_id, ttl_secs = lease.ttl.as_secs(), "vault lease obtained");
        Ok(lease)
    }

    async fn revoke_lease(&self, lease_id: &str) -> Result<(), SecretError> {
        let url = self.url("v1/sys/leases/revoke")?;
        let response = self
            .http_client
            .put(url)
            .header("X-Vault-Token", &self.config.token)
            .json(&serde_json::json!({ "lease_id": lease_id }))
            .send()
            .await
            .map_err(|e| SecretError::Backend(format!("vault revoke request: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SecretError::Backend(format!(
                "vault lease revoke failed with status {status}"
            )));
        }
        debug!(lease_id, "vault lease revoked");
        Ok(())
    }
}
