//! Leased-secret cache.
//!
//! Holds at most one current lease per [`SecretKind`] and publishes it through
//! a `watch` channel, so readers always see a whole lease. Refreshes are
//! single-flight per kind: whoever queues behind an in-flight refresh gets
//! that refresh's outcome instead of calling the backend again. A failed or
//! timed-out refresh leaves the cached lease in place; it is served until its
//! hard expiry and never after.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    SecretBackend, SecretError, SecretKind, SecretLease, SigningMaterial, StaticSecrets,
};
use crate::config::SecretsConfig;

/// Snapshot published to watchers of one kind.
#[derive(Debug, Clone, Default)]
pub struct LeaseState {
    /// Bumped on every installed lease.
    pub serial: u64,
    pub current: Option<Arc<SecretLease>>,
    /// The lease replaced by `current`, with the instant it was replaced.
    pub previous: Option<(Arc<SecretLease>, Instant)>,
}

/// Outcome of the most recent refresh attempt, shared with queued callers.
#[derive(Default)]
struct LastAttempt {
    outcome: Option<Result<Arc<SecretLease>, SecretError>>,
}

struct Slot {
    kind: SecretKind,
    state: watch::Sender<LeaseState>,
    attempts: AtomicU64,
    refresh_lock: Mutex<LastAttempt>,
}

impl Slot {
    fn new(kind: SecretKind) -> Self {
        let (state, _) = watch::channel(LeaseState::default());
        Self {
            kind,
            state,
            attempts: AtomicU64::new(0),
            refresh_lock: Mutex::new(LastAttempt::default()),
        }
    }
}

/// Cache of leased secrets with background refresh.
pub struct SecretCache {
    backend: Arc<dyn SecretBackend>,
    config: SecretsConfig,
    static_secrets: StaticSecrets,
    signing: Slot,
    database: Slot,
    cancel: CancellationToken,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl SecretCache {
    /// Read static secrets and obtain the first lease of every kind.
    ///
    /// No background tasks are started; see [`SecretCache::start`].
    pub async fn initialize(
        backend: Arc<dyn SecretBackend>,
        config: SecretsConfig,
    ) -> Result<Arc<Self>, SecretError> {
        let static_secrets = timeout(config.backend_timeout, backend.read_static())
            .await
            .map_err(|_| SecretError::Timeout(config.backend_timeout))??;

        let cache = Arc::new(Self {
            backend,
            config,
            static_secrets,
            signing: Slot::new(SecretKind::SigningKey),
            database: Slot::new(SecretKind::DbCredential),
            cancel: CancellationToken::new(),
            tasks: StdMutex::new(Vec::new()),
        });
        for kind in SecretKind::ALL {
            cache.refresh(kind).await?;
        }
        Ok(cache)
    }

    /// Initialize, then spawn one refresh loop per kind.
    ///
    /// Fails if the backend cannot supply every secret up front.
    pub async fn start(
        backend: Arc<dyn SecretBackend>,
        config: SecretsConfig,
    ) -> Result<Arc<Self>, SecretError> {
        let cache = Self::initialize(backend, config).await?;
        let handles: Vec<_> = SecretKind::ALL
            .into_iter()
            .map(|kind| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.refresh_loop(kind).await })
            })
            .collect();
        if let Ok(mut tasks) = cache.tasks.lock() {
            tasks.extend(handles);
        }
        info!("secret cache started");
        Ok(cache)
    }

    fn slot(&self, kind: SecretKind) -> &Slot {
        match kind {
            SecretKind::SigningKey => &self.signing,
            SecretKind::DbCredential => &self.database,
        }
    }

    pub fn static_secrets(&self) -> &StaticSecrets {
        &self.static_secrets
    }

    /// Current lease of `kind`. Never blocks and never calls the backend.
    pub fn get_current(&self, kind: SecretKind) -> Result<Arc<SecretLease>, SecretError> {
        let state = self.slot(kind).state.borrow();
        match &state.current {
            Some(lease) if !lease.is_expired(Instant::now()) => Ok(Arc::clone(lease)),
            Some(lease) => {
                error!(target: "audit", %kind, lease_id = %lease.lease_id, "lease past hard expiry, failing closed");
                Err(SecretError::Unavailable(kind))
            }
            None => Err(SecretError::Unavailable(kind)),
        }
    }

    /// Key that new tokens are signed with.
    pub fn signing_key(&self) -> Result<SigningMaterial, SecretError> {
        self.get_current(SecretKind::SigningKey)?
            .signing()
            .cloned()
            .ok_or_else(|| SecretError::Malformed("signing-key lease without key material".into()))
    }

    /// Keys accepted for verification: the current key and, within the grace
    /// window, the one it replaced. Empty when no key is usable.
    ///
    /// The replaced key stays for the whole grace window even past its own
    /// lease expiry; it never signs again, so only verification depends on it.
    pub fn verification_keys(&self) -> Vec<SigningMaterial> {
        let now = Instant::now();
        let state = self.slot(SecretKind::SigningKey).state.borrow();
        let mut keys = Vec::with_capacity(2);
        if let Some(current) = state.current.as_ref().filter(|l| !l.is_expired(now))
            && let Some(material) = current.signing()
        {
            keys.push(material.clone());
        }
        if let Some((previous, retired_at)) = &state.previous
            && now < *retired_at + self.config.signing_key_grace
            && let Some(material) = previous.signing()
        {
            keys.push(material.clone());
        }
        keys
    }

    /// Subscribe to lease changes of `kind`.
    pub fn watch(&self, kind: SecretKind) -> watch::Receiver<LeaseState> {
        self.slot(kind).state.subscribe()
    }

    /// Fetch a new lease of `kind` and install it.
    ///
    /// Callers that arrive while a refresh is running wait for it and share
    /// its outcome. The backend call is bounded by `backend_timeout`.
    pub async fn refresh(&self, kind: SecretKind) -> Result<Arc<SecretLease>, SecretError> {
        let slot = self.slot(kind);
        let seen = slot.attempts.load(Ordering::SeqCst);
        let mut last = slot.refresh_lock.lock().await;
        if slot.attempts.load(Ordering::SeqCst) != seen
            && let Some(outcome) = &last.outcome
        {
            return outcome.clone();
        }

        let outcome = match timeout(self.config.backend_timeout, self.backend.lease(kind)).await {
            Ok(Ok(lease)) => {
                let lease = Arc::new(lease);
                self.install(slot, Arc::clone(&lease));
                Ok(lease)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SecretError::Timeout(self.config.backend_timeout)),
        };
        if let Err(e) = &outcome {
            warn!(%kind, error = %e, "secret refresh failed, keeping cached lease");
        }
        last.outcome = Some(outcome.clone());
        slot.attempts.fetch_add(1, Ordering::SeqCst);
        outcome
    }

    fn install(&self, slot: &Slot, lease: Arc<SecretLease>) {
        let now = Instant::now();
        debug!(kind = %slot.kind, lease_id = %lease.lease_id, ttl_secs = lease.ttl.as_secs(), "installing lease");
        slot.state.send_modify(|state| {
            let replaced = state.current.replace(lease);
            if slot.kind == SecretKind::SigningKey {
                state.previous = replaced.map(|old| (old, now));
            }
            state.serial += 1;
        });
    }

    async fn refresh_loop(&self, kind: SecretKind) {
        let mut rx = self.watch(kind);
        loop {
            let due = rx
                .borrow_and_update()
                .current
                .as_ref()
                .map(|lease| lease.refresh_due())
                .unwrap_or_else(Instant::now);

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = sleep_until(due) => {}
                // Someone else refreshed; recompute the deadline.
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    continue;
                }
            }

            while self.refresh(kind).await.is_err() {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = sleep(self.config.retry_interval) => {}
                }
            }
        }
    }

    /// Stop the refresh loops and release held leases (best effort).
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles = self
            .tasks
            .lock()
            .map(|mut tasks| std::mem::take(&mut *tasks))
            .unwrap_or_default();
        join_all(handles).await;

        let mut lease_ids = Vec::new();
        for kind in SecretKind::ALL {
            let state = self.slot(kind).state.borrow();
            lease_ids.extend(state.current.iter().map(|l| l.lease_id.clone()));
            lease_ids.extend(state.previous.iter().map(|(l, _)| l.lease_id.clone()));
        }
        for lease_id in lease_ids {
            match timeout(
                self.config.backend_timeout,
                self.backend.revoke_lease(&lease_id),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(lease_id, error = %e, "failed to revoke lease on shutdown"),
                Err(_) => warn!(lease_id, "timed out revoking lease on shutdown"),
            }
        }
        info!("secret cache stopped");
    }

    /// Time left before the current lease of `kind` must not be served.
    pub fn remaining(&self, kind: SecretKind) -> Option<Duration> {
        self.slot(kind)
            .state
            .borrow()
            .current
            .as_ref()
            .map(|lease| lease.expires_at().saturating_duration_since(Instant::now()))
    }
}
