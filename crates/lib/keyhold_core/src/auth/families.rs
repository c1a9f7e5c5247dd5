//! Refresh-token families.
//!
//! Every login opens a family at generation 0. A refresh consumes the head
//! generation and installs the next one through a compare-and-swap on the
//! family row; presenting anything but the head is reuse and revokes the whole
//! family. `Revoked` is terminal.
//!
//! Only SHA-256 digests of refresh token values are stored.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::distr::Alphanumeric;
use rand::{Rng, rng};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::AuthError;
use crate::models::auth::{RefreshTokenRecord, TokenFamily};

/// Generate a cryptographically random refresh token (64 alphanumeric chars).
pub fn generate_refresh_token() -> String {
    rng()
        .sample_iter(&Alphanumeric)
        .take(64)
        .map(char::from)
        .collect()
}

/// SHA-256 hash a refresh token for storage.
pub fn hash_refresh_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Result of a compare-and-swap on a family head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotateOutcome {
    /// The expected generation was the head; the next generation is installed.
    Rotated,
    /// The expected generation was already consumed. The family has been
    /// revoked as part of the same atomic step.
    Stale { head: i64 },
    /// The family was already revoked.
    Revoked,
    /// No such family.
    Missing,
}

/// What a purge removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Refresh token digests.
    pub tokens: u64,
    /// Families that were revoked or had no redeemable token left.
    pub families: u64,
}

/// Persistence of family heads and refresh token digests.
#[async_trait]
pub trait FamilyStore: Send + Sync {
    /// Open a new family whose generation-0 token is `first`.
    async fn create_family(&self, user_id: Uuid, first: RefreshTokenRecord)
    -> Result<(), AuthError>;

    /// Find a token digest together with its family head.
    async fn find_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<(RefreshTokenRecord, TokenFamily)>, AuthError>;

    /// Advance `family_id` from `expected` to `next.generation` atomically.
    async fn rotate(
        &self,
        family_id: Uuid,
        expected: i64,
        next: RefreshTokenRecord,
    ) -> Result<RotateOutcome, AuthError>;

    /// Mark a family revoked. Returns `true` if this call revoked it.
    async fn revoke_family(&self, family_id: Uuid) -> Result<bool, AuthError>;

    /// Ids of the user's families that are still active.
    async fn active_families(&self, user_id: Uuid) -> Result<Vec<Uuid>, AuthError>;

    /// Drop token digests that expired before `now`, then every family that is
    /// revoked or has no digest left, together with its digests.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<PurgeReport, AuthError>;
}

/// In-process family store.
///
/// `rotate` holds the family's shard lock for the whole check-and-advance, so
/// concurrent rotations of one family serialize and exactly one wins.
#[derive(Default)]
pub struct MemoryFamilyStore {
    families: DashMap<Uuid, TokenFamily>,
    tokens: DashMap<String, RefreshTokenRecord>,
}

impl MemoryFamilyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn family(&self, family_id: Uuid) -> Option<TokenFamily> {
        self.families.get(&family_id).map(|f| f.clone())
    }
}

#[async_trait]
impl FamilyStore for MemoryFamilyStore {
    async fn create_family(
        &self,
        user_id: Uuid,
        first: RefreshTokenRecord,
    ) -> Result<(), AuthError> {
        // Token first, so a concurrent purge never sees the family empty.
        let family_id = first.family_id;
        let generation = first.generation;
        self.tokens.insert(first.token_hash.clone(), first);
        self.families.insert(
            family_id,
            TokenFamily {
                id: family_id,
                user_id,
                generation,
                revoked: false,
            },
        );
        Ok(())
    }

    async fn find_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<(RefreshTokenRecord, TokenFamily)>, AuthError> {
        let Some(record) = self.tokens.get(token_hash).map(|r| r.clone()) else {
            return Ok(None);
        };
        Ok(self
            .families
            .get(&record.family_id)
            .map(|family| (record, family.clone())))
    }

    async fn rotate(
        &self,
        family_id: Uuid,
        expected: i64,
        next: RefreshTokenRecord,
    ) -> Result<RotateOutcome, AuthError> {
        let Some(mut family) = self.families.get_mut(&family_id) else {
            return Ok(RotateOutcome::Missing);
        };
        if family.revoked {
            return Ok(RotateOutcome::Revoked);
        }
        if family.generation != expected {
            family.revoked = true;
            return Ok(RotateOutcome::Stale {
                head: family.generation,
            });
        }
        family.generation = next.generation;
        self.tokens.insert(next.token_hash.clone(), next);
        Ok(RotateOutcome::Rotated)
    }

    async fn revoke_family(&self, family_id: Uuid) -> Result<bool, AuthError> {
        Ok(match self.families.get_mut(&family_id) {
            Some(mut family) if !family.revoked => {
                family.revoked = true;
                true
            }
            _ => false,
        })
    }

    async fn active_families(&self, user_id: Uuid) -> Result<Vec<Uuid>, AuthError> {
        Ok(self
            .families
            .iter()
            .filter(|f| f.user_id == user_id && !f.revoked)
            .map(|f| f.id)
            .collect())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<PurgeReport, AuthError> {
        let revoked: HashSet<Uuid> = self
            .families
            .iter()
            .filter(|f| f.revoked)
            .map(|f| f.id)
            .collect();
        let tokens_before = self.tokens.len();
        self.tokens
            .retain(|_, record| record.expires_at > now && !revoked.contains(&record.family_id));

        let live: HashSet<Uuid> = self.tokens.iter().map(|r| r.family_id).collect();
        let families_before = self.families.len();
        self.families
            .retain(|id, family| !family.revoked && live.contains(id));

        Ok(PurgeReport {
            tokens: (tokens_before - self.tokens.len()) as u64,
            families: (families_before - self.families.len()) as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;

    use super::*;

    fn record(family_id: Uuid, generation: i64) -> RefreshTokenRecord {
        RefreshTokenRecord {
            token_hash: hash_refresh_token(&generate_refresh_token()),
            family_id,
            generation,
            expires_at: Utc::now() + Duration::days(1),
        }
    }

    #[test]
    fn refresh_tokens_are_random_and_hash_stably() {
        let a = generate_refresh_token();
        let b = generate_refresh_token();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
        assert_eq!(hash_refresh_token(&a), hash_refresh_token(&a));
        assert_ne!(hash_refresh_token(&a), hash_refresh_token(&b));
    }

    #[tokio::test]
    async fn rotate_advances_head() {
        let store = MemoryFamilyStore::new();
        let family = Uuid::new_v4();
        let first = record(family, 0);
        store.create_family(Uuid::new_v4(), first.clone()).await.unwrap();

        let next = record(family, 1);
        assert_eq!(
            store.rotate(family, 0, next.clone()).await.unwrap(),
            RotateOutcome::Rotated
        );
        let (found, head) = store.find_token(&next.token_hash).await.unwrap().unwrap();
        assert_eq!(found.generation, 1);
        assert_eq!(head.generation, 1);

        let (old, _) = store.find_token(&first.token_hash).await.unwrap().unwrap();
        assert_eq!(old.generation, 0);
    }

    #[tokio::test]
    async fn stale_rotation_revokes_family() {
        let store = MemoryFamilyStore::new();
        let family = Uuid::new_v4();
        store.create_family(Uuid::new_v4(), record(family, 0)).await.unwrap();
        store.rotate(family, 0, record(family, 1)).await.unwrap();

        assert_eq!(
            store.rotate(family, 0, record(family, 1)).await.unwrap(),
            RotateOutcome::Stale { head: 1 }
        );
        assert!(store.family(family).unwrap().revoked);
        assert_eq!(
            store.rotate(family, 1, record(family, 2)).await.unwrap(),
            RotateOutcome::Revoked
        );
    }

    #[tokio::test]
    async fn concurrent_rotations_have_one_winner() {
        let store = Arc::new(MemoryFamilyStore::new());
        let family = Uuid::new_v4();
        store.create_family(Uuid::new_v4(), record(family, 0)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.rotate(family, 0, record(family, 1)).await.unwrap()
            }));
        }
        let mut rotated = 0;
        for handle in handles {
            if handle.await.unwrap() == RotateOutcome::Rotated {
                rotated += 1;
            }
        }
        assert_eq!(rotated, 1);
        assert!(store.family(family).unwrap().revoked);
    }

    #[tokio::test]
    async fn revoke_is_reported_once() {
        let store = MemoryFamilyStore::new();
        let user = Uuid::new_v4();
        let family = Uuid::new_v4();
        store.create_family(user, record(family, 0)).await.unwrap();
        assert_eq!(store.active_families(user).await.unwrap(), vec![family]);
        assert!(store.revoke_family(family).await.unwrap());
        assert!(!store.revoke_family(family).await.unwrap());
        assert!(store.active_families(user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn purge_drops_expired_digests() {
        let store = MemoryFamilyStore::new();
        let family = Uuid::new_v4();
        let mut expired = record(family, 0);
        expired.expires_at = Utc::now() - Duration::seconds(1);
        store.create_family(Uuid::new_v4(), expired.clone()).await.unwrap();
        assert_eq!(
            store.purge_expired(Utc::now()).await.unwrap(),
            PurgeReport {
                tokens: 1,
                families: 1
            }
        );
        assert!(store.find_token(&expired.token_hash).await.unwrap().is_none());
        assert!(store.family(family).is_none());
    }

    #[tokio::test]
    async fn purge_drops_revoked_families_and_keeps_live_ones() {
        let store = MemoryFamilyStore::new();
        let user = Uuid::new_v4();
        let live = Uuid::new_v4();
        let revoked = Uuid::new_v4();
        store.create_family(user, record(live, 0)).await.unwrap();
        store.rotate(live, 0, record(live, 1)).await.unwrap();
        store.create_family(user, record(revoked, 0)).await.unwrap();
        store.revoke_family(revoked).await.unwrap();

        assert_eq!(
            store.purge_expired(Utc::now()).await.unwrap(),
            PurgeReport {
                tokens: 1,
                families: 1
            }
        );
        assert_eq!(store.family(live).unwrap().generation, 1);
        assert!(store.family(revoked).is_none());
    }
}
