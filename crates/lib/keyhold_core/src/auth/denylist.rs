//! Access-token denylist.
//!
//! Access tokens are stateless, so explicit revocation needs a lookup on the
//! verification path. Entries live only as long as the tokens they block,
//! which keeps the list bounded by the number of tokens revoked within one
//! access-token lifetime.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Interval of the background sweep.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// What a denylist entry blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DenyKey {
    /// A single access token, by `jti`.
    Token(Uuid),
    /// Every access token minted from a refresh-token family, by `fid`.
    Family(Uuid),
}

/// In-memory denylist with per-entry expiry.
#[derive(Debug, Default)]
pub struct Denylist {
    entries: DashMap<DenyKey, DateTime<Utc>>,
}

impl Denylist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deny `key` until `until`. An existing later expiry is kept.
    pub fn deny(&self, key: DenyKey, until: DateTime<Utc>) {
        self.entries
            .entry(key)
            .and_modify(|existing| {
                if until > *existing {
                    *existing = until;
                }
            })
            .or_insert(until);
    }

    /// Whether `key` is denied at `now`.
    pub fn is_denied(&self, key: DenyKey, now: DateTime<Utc>) -> bool {
        self.entries
            .get(&key)
            .is_some_and(|until| now < *until)
    }

    /// Evict expired entries.
    pub fn cleanup(&self, now: DateTime<Utc>) {
        self.entries.retain(|_, until| now < *until);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Spawn a periodic cleanup task that stops when `cancel` fires.
    pub fn spawn_cleanup_task(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let list = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        list.cleanup(Utc::now());
                        debug!(entries = list.len(), "denylist swept");
                    }
                }
            }
        })
    }
}
