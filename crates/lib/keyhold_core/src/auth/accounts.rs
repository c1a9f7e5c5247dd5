//! Account flows on top of the credential store.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use super::AuthError;
use super::crypto::{EncryptionGateway, normalize_email};
use super::password::{hash_password, verify_dummy, verify_password};
use super::permissions::Role;
use super::store::CredentialStore;
use crate::models::auth::{NewAccount, NewUser, Profile, ProfileUpdate, StoredUser, UserUpdate};

/// Minimum password length in characters.
pub const MIN_PASSWORD_LEN: usize = 8;

/// Signup, credential checks and profile reads.
///
/// The only place plaintext PII meets the store: everything written goes
/// through the encryption gateway first.
#[derive(Clone)]
pub struct AccountService {
    store: Arc<dyn CredentialStore>,
    gateway: EncryptionGateway,
    auto_assign_default_roles: bool,
}

impl AccountService {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        gateway: EncryptionGateway,
        auto_assign_default_roles: bool,
    ) -> Self {
        Self {
            store,
            gateway,
            auto_assign_default_roles,
        }
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    /// Create an account and return its id.
    pub async fn register(&self, account: NewAccount) -> Result<Uuid, AuthError> {
        if account.password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AuthError::Validation(format!(
                "Password must be at least {MIN_PASSWORD_LEN} characters"
            )));
        }
        let email = normalize_email(&account.email);
        if email.is_empty() || !email.contains('@') {
            return Err(AuthError::Validation("A valid email is required".into()));
        }
        if account.first_name.trim().is_empty() || account.last_name.trim().is_empty() {
            return Err(AuthError::Validation(
                "First and last name are required".into(),
            ));
        }

        let email_lookup = self.gateway.email_lookup(&email)?;
        if self.store.find_user_by_lookup(&email_lookup).await?.is_some() {
            return Err(AuthError::Validation("Email already registered".into()));
        }

        let user = NewUser {
            first_name: account.first_name.trim().to_string(),
            middle_name: account
                .middle_name
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty()),
            last_name: account.last_name.trim().to_string(),
            phone: self.gateway.encrypt_opt(account.phone.as_deref())?,
            email: self.gateway.encrypt(&email)?,
            email_lookup,
            password_hash: hash_password(&account.password)?,
        };
        let user_id = self.store.create_user(user).await?;

        if self.auto_assign_default_roles {
            for role in self.store.default_roles().await? {
                self.store.assign_role(user_id, role).await?;
            }
        }
        info!(%user_id, "account registered");
        Ok(user_id)
    }

    /// Check an email/password pair.
    ///
    /// Unknown email and wrong password are indistinguishable, down to the
    /// hashing work done. A locked account is only reported after the password
    /// matched.
    pub async fn authenticate(&self, email: &str, password: &str) -> Result<StoredUser, AuthError> {
        let lookup = self.gateway.email_lookup(email)?;
        let Some(user) = self.store.find_user_by_lookup(&lookup).await? else {
            verify_dummy(password);
            return Err(AuthError::InvalidCredentials);
        };
        if !verify_password(password, &user.password_hash)? {
            return Err(AuthError::InvalidCredentials);
        }
        if user.locked {
            return Err(AuthError::AccountLocked);
        }
        Ok(user)
    }

    /// Decrypted profile with role keys.
    pub async fn profile(&self, user_id: Uuid) -> Result<Profile, AuthError> {
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or(AuthError::UserNotFound)?;
        let mut roles = self.store.user_roles(user_id).await?;
        roles.sort();
        Ok(Profile {
            id: user.id,
            first_name: user.first_name,
            middle_name: user.middle_name,
            last_name: user.last_name,
            phone: self.gateway.decrypt_opt(user.phone.as_deref())?,
            email: self.gateway.decrypt(&user.email)?,
            roles,
            locked: user.locked,
        })
    }

    /// Apply the owner's profile change and return the new profile.
    ///
    /// A new phone is encrypted again under the current field key.
    pub async fn update_profile(
        &self,
        user_id: Uuid,
        update: ProfileUpdate,
    ) -> Result<Profile, AuthError> {
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or(AuthError::UserNotFound)?;

        let first_name = required_name(update.first_name, user.first_name)?;
        let last_name = required_name(update.last_name, user.last_name)?;
        let middle_name = match update.middle_name {
            Some(m) => Some(m.trim().to_string()).filter(|m| !m.is_empty()),
            None => user.middle_name,
        };
        let phone = match update.phone.as_deref().map(str::trim) {
            Some("") => None,
            Some(phone) => Some(self.gateway.encrypt(phone)?),
            None => user.phone,
        };

        self.store
            .update_user(
                user_id,
                UserUpdate {
                    first_name,
                    middle_name,
                    last_name,
                    phone,
                },
            )
            .await?;
        info!(%user_id, "profile updated");
        self.profile(user_id).await
    }

    pub async fn assign_role(&self, user_id: Uuid, role: Role) -> Result<(), AuthError> {
        self.store.assign_role(user_id, role).await?;
        info!(target: "audit", %user_id, %role, "role assigned");
        Ok(())
    }

    /// Lock or unlock an account. Token revocation on lock is the token
    /// service's job; see `TokenService::set_locked`.
    pub async fn set_locked(&self, user_id: Uuid, locked: bool) -> Result<(), AuthError> {
        self.store.set_locked(user_id, locked).await?;
        info!(target: "audit", %user_id, locked, "account lock changed");
        Ok(())
    }
}

fn required_name(update: Option<String>, current: String) -> Result<String, AuthError> {
    match update {
        None => Ok(current),
        Some(name) if name.trim().is_empty() => Err(AuthError::Validation(
            "First and last name are required".into(),
        )),
        Some(name) => Ok(name.trim().to_string()),
    }
}
