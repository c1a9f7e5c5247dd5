//! In-process secret backend.
//!
//! Mints a fresh random HS256 signing key per lease and hands out a fixed
//! database credential. Used by tests and by the server when no Vault address
//! is configured.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::distr::Alphanumeric;
use rand::{Rng, rng};
use tokio::time::Instant;
use uuid::Uuid;

use super::{
    DbCredential, SecretBackend, SecretError, SecretKind, SecretLease, SecretMaterial,
    SigningMaterial, StaticSecrets,
};
use crate::auth::crypto::{FieldKey, LookupKey};

/// Lease ttl handed out unless configured otherwise.
const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

/// Secret backend held entirely in memory.
pub struct MemoryBackend {
    static_secrets: StaticSecrets,
    db_credential: DbCredential,
    signing_key: Option<SigningMaterial>,
    ttl: Duration,
    delay_ms: AtomicU64,
    failing: AtomicBool,
    signing_fetches: AtomicUsize,
    db_fetches: AtomicUsize,
    revoked: Mutex<Vec<String>>,
}

impl MemoryBackend {
    /// Backend with random static keys and a placeholder db credential.
    pub fn new() -> Self {
        Self {
            static_secrets: StaticSecrets {
                field_key: FieldKey::generate(),
                lookup_key: LookupKey::generate(),
            },
            db_credential: DbCredential {
                username: "keyhold".into(),
                password: String::new(),
            },
            signing_key: None,
            ttl: DEFAULT_TTL,
            delay_ms: AtomicU64::new(0),
            failing: AtomicBool::new(false),
            signing_fetches: AtomicUsize::new(0),
            db_fetches: AtomicUsize::new(0),
            revoked: Mutex::new(Vec::new()),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sleep this long inside every lease call.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.set_delay(delay);
        self
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn with_db_credential(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.db_credential = DbCredential {
            username: username.into(),
            password: password.into(),
        };
        self
    }

    /// Hand out `key` on every signing lease instead of minting one.
    pub fn with_signing_key(mut self, key: SigningMaterial) -> Self {
        self.signing_key = Some(key);
        self
    }

    pub fn with_static_secrets(mut self, secrets: StaticSecrets) -> Self {
        self.static_secrets = secrets;
        self
    }

    /// Make subsequent lease calls fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of leases handed out for `kind`, failed attempts included.
    pub fn fetch_count(&self, kind: SecretKind) -> usize {
        self.counter(kind).load(Ordering::SeqCst)
    }

    /// Lease ids revoked so far.
    pub fn revoked_leases(&self) -> Vec<String> {
        self.revoked
            .lock()
            .map(|ids| ids.clone())
            .unwrap_or_default()
    }

    fn counter(&self, kind: SecretKind) -> &AtomicUsize {
        match kind {
            SecretKind::SigningKey => &self.signing_fetches,
            SecretKind::DbCredential => &self.db_fetches,
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn random_secret() -> String {
    rng()
        .sample_iter(&Alphanumeric)
        .take(48)
        .map(char::from)
        .collect()
}

#[async_trait]
impl SecretBackend for MemoryBackend {
    async fn read_static(&self) -> Result<StaticSecrets, SecretError> {
        Ok(self.static_secrets.clone())
    }

    async fn lease(&self, kind: SecretKind) -> Result<SecretLease, SecretError> {
        let obtained_at = Instant::now();
        let obtained_at_utc = Utc::now();
        self.counter(kind).fetch_add(1, Ordering::SeqCst);
        let delay_ms = self.delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(SecretError::Backend("memory backend set to fail".into()));
        }

        let lease_id = Uuid::new_v4().to_string();
        let material = match kind {
            SecretKind::SigningKey => SecretMaterial::Signing(match &self.signing_key {
                Some(key) => key.clone(),
                None => SigningMaterial::hs256(format!("mem-{lease_id}"), random_secret().as_bytes()),
            }),
            SecretKind::DbCredential => SecretMaterial::Database(self.db_credential.clone()),
        };
        Ok(SecretLease {
            lease_id,
            kind,
            material,
            obtained_at,
            obtained_at_utc,
            ttl: self.ttl,
        })
    }

    async fn revoke_lease(&self, lease_id: &str) -> Result<(), SecretError> {
        if let Ok(mut ids) = self.revoked.lock() {
            ids.push(lease_id.to_string());
        }
        Ok(())
    }
}
