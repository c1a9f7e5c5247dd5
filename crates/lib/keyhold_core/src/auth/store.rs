//! Credential store seam.
//!
//! The system of record for users, roles and permissions is external; this
//! trait is the adapter boundary. [`super::queries::PgCredentialStore`] backs it
//! with PostgreSQL, [`MemoryCredentialStore`] keeps everything in process for
//! tests and local runs.

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use uuid::Uuid;

use super::AuthError;
use super::permissions::{Permission, Role};
use crate::models::auth::{NewUser, StoredUser, UserUpdate};

/// Reads and writes user, role and permission records.
///
/// PII columns pass through as opaque ciphertext; encoding and decoding is the
/// encryption gateway's job.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Look a user up by email lookup digest.
    async fn find_user_by_lookup(&self, email_lookup: &str)
    -> Result<Option<StoredUser>, AuthError>;

    async fn get_user(&self, user_id: Uuid) -> Result<Option<StoredUser>, AuthError>;

    /// Insert a user. A duplicate email lookup digest is a validation error.
    async fn create_user(&self, user: NewUser) -> Result<Uuid, AuthError>;

    /// Overwrite the editable columns. Fails with `UserNotFound` for unknown ids.
    async fn update_user(&self, user_id: Uuid, update: UserUpdate) -> Result<(), AuthError>;

    /// Lock or unlock an account. Fails with `UserNotFound` for unknown ids.
    async fn set_locked(&self, user_id: Uuid, locked: bool) -> Result<(), AuthError>;

    async fn user_roles(&self, user_id: Uuid) -> Result<Vec<Role>, AuthError>;

    /// Link a role to a user. Idempotent.
    async fn assign_role(&self, user_id: Uuid, role: Role) -> Result<(), AuthError>;

    /// Permissions linked to any of `roles`, possibly with duplicates.
    async fn permissions_for_roles(&self, roles: &[Role]) -> Result<Vec<Permission>, AuthError>;

    /// Roles flagged `is_default`.
    async fn default_roles(&self) -> Result<Vec<Role>, AuthError>;
}

/// In-process credential store.
pub struct MemoryCredentialStore {
    users: DashMap<Uuid, StoredUser>,
    lookups: DashMap<String, Uuid>,
    user_roles: DashMap<Uuid, Vec<Role>>,
    role_permissions: HashMap<Role, Vec<Permission>>,
}

impl MemoryCredentialStore {
    /// Store seeded with the deploy-time role/permission links.
    pub fn seeded() -> Self {
        let role_permissions = Role::ALL
            .into_iter()
            .map(|role| (role, role.seeded_permissions().to_vec()))
            .collect();
        Self::with_role_permissions(role_permissions)
    }

    /// Store with an explicit role/permission link table.
    pub fn with_role_permissions(role_permissions: HashMap<Role, Vec<Permission>>) -> Self {
        Self {
            users: DashMap::new(),
            lookups: DashMap::new(),
            user_roles: DashMap::new(),
            role_permissions,
        }
    }
}

impl Default for MemoryCredentialStore {
    fn default() -> Self {
        Self::seeded()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn find_user_by_lookup(
        &self,
        email_lookup: &str,
    ) -> Result<Option<StoredUser>, AuthError> {
        let Some(id) = self.lookups.get(email_lookup).map(|entry| *entry) else {
            return Ok(None);
        };
        Ok(self.users.get(&id).map(|user| user.clone()))
    }

    async fn get_user(&self, user_id: Uuid) -> Result<Option<StoredUser>, AuthError> {
        Ok(self.users.get(&user_id).map(|user| user.clone()))
    }

    async fn create_user(&self, user: NewUser) -> Result<Uuid, AuthError> {
        let id = Uuid::new_v4();
        match self.lookups.entry(user.email_lookup.clone()) {
            Entry::Occupied(_) => {
                return Err(AuthError::Validation("Email already registered".into()));
            }
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }
        self.users.insert(
            id,
            StoredUser {
                id,
                first_name: user.first_name,
                middle_name: user.middle_name,
                last_name: user.last_name,
                phone: user.phone,
                email: user.email,
                email_lookup: user.email_lookup,
                password_hash: user.password_hash,
                locked: false,
            },
        );
        Ok(id)
    }

    async fn update_user(&self, user_id: Uuid, update: UserUpdate) -> Result<(), AuthError> {
        let mut user = self.users.get_mut(&user_id).ok_or(AuthError::UserNotFound)?;
        user.first_name = update.first_name;
        user.middle_name = update.middle_name;
        user.last_name = update.last_name;
        user.phone = update.phone;
        Ok(())
    }

    async fn set_locked(&self, user_id: Uuid, locked: bool) -> Result<(), AuthError> {
        let mut user = self.users.get_mut(&user_id).ok_or(AuthError::UserNotFound)?;
        user.locked = locked;
        Ok(())
    }

    async fn user_roles(&self, user_id: Uuid) -> Result<Vec<Role>, AuthError> {
        Ok(self
            .user_roles
            .get(&user_id)
            .map(|roles| roles.clone())
            .unwrap_or_default())
    }

    async fn assign_role(&self, user_id: Uuid, role: Role) -> Result<(), AuthError> {
        if !self.users.contains_key(&user_id) {
            return Err(AuthError::UserNotFound);
        }
        let mut roles = self.user_roles.entry(user_id).or_default();
        if !roles.contains(&role) {
            roles.push(role);
        }
        Ok(())
    }

    async fn permissions_for_roles(&self, roles: &[Role]) -> Result<Vec<Permission>, AuthError> {
        Ok(roles
            .iter()
            .filter_map(|role| self.role_permissions.get(role))
            .flatten()
            .copied()
            .collect())
    }

    async fn default_roles(&self) -> Result<Vec<Role>, AuthError> {
        Ok(Role::ALL.into_iter().filter(|r| r.is_default()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_user(lookup: &str) -> NewUser {
        NewUser {
            first_name: "Ivan".into(),
            middle_name: Some("Petrovich".into()),
            last_name: "Sidorov".into(),
            phone: None,
            email: "ciphertext".into(),
            email_lookup: lookup.into(),
            password_hash: "hash".into(),
        }
    }

    #[tokio::test]
    async fn duplicate_lookup_is_rejected() {
        let store = MemoryCredentialStore::seeded();
        store.create_user(new_user("dup")).await.unwrap();
        assert!(matches!(
            store.create_user(new_user("dup")).await,
            Err(AuthError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn assign_role_is_idempotent() {
        let store = MemoryCredentialStore::seeded();
        let id = store.create_user(new_user("x")).await.unwrap();
        store.assign_role(id, Role::User).await.unwrap();
        store.assign_role(id, Role::User).await.unwrap();
        assert_eq!(store.user_roles(id).await.unwrap(), vec![Role::User]);
    }

    #[tokio::test]
    async fn unknown_user_cannot_be_locked_or_assigned() {
        let store = MemoryCredentialStore::seeded();
        let ghost = Uuid::new_v4();
        assert!(matches!(
            store.set_locked(ghost, true).await,
            Err(AuthError::UserNotFound)
        ));
        assert!(matches!(
            store.assign_role(ghost, Role::Admin).await,
            Err(AuthError::UserNotFound)
        ));
        let update = UserUpdate {
            first_name: "A".into(),
            middle_name: None,
            last_name: "B".into(),
            phone: None,
        };
        assert!(matches!(
            store.update_user(ghost, update).await,
            Err(AuthError::UserNotFound)
        ));
    }

    #[tokio::test]
    async fn lookup_finds_created_user() {
        let store = MemoryCredentialStore::seeded();
        let id = store.create_user(new_user("find-me")).await.unwrap();
        let found = store.find_user_by_lookup("find-me").await.unwrap().unwrap();
        assert_eq!(found.id, id);
        assert!(!found.locked);
        assert!(store.find_user_by_lookup("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_user_keeps_credentials() {
        let store = MemoryCredentialStore::seeded();
        let id = store.create_user(new_user("edit")).await.unwrap();
        store
            .update_user(
                id,
                UserUpdate {
                    first_name: "Pyotr".into(),
                    middle_name: None,
                    last_name: "Sidorov".into(),
                    phone: Some("phone-ciphertext".into()),
                },
            )
            .await
            .unwrap();

        let user = store.get_user(id).await.unwrap().unwrap();
        assert_eq!(user.first_name, "Pyotr");
        assert_eq!(user.middle_name, None);
        assert_eq!(user.phone.as_deref(), Some("phone-ciphertext"));
        assert_eq!(user.email_lookup, "edit");
        assert_eq!(user.password_hash, "hash");
    }

    #[tokio::test]
    async fn default_roles_follow_catalog() {
        let store = MemoryCredentialStore::seeded();
        assert_eq!(store.default_roles().await.unwrap(), vec![Role::User]);
    }
}
