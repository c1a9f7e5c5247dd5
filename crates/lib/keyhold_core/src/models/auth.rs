//! Authentication domain models.
//!
//! These are internal domain models, distinct from the HTTP request/response
//! shapes in `keyhold_api`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::AuthError;
use crate::auth::permissions::{Permission, Role};

/// User row as persisted: PII columns hold ciphertext.
#[derive(Debug, Clone)]
pub struct StoredUser {
    pub id: Uuid,
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: String,
    /// Encrypted phone.
    pub phone: Option<String>,
    /// Encrypted email.
    pub email: String,
    /// HMAC digest of the normalized email.
    pub email_lookup: String,
    pub password_hash: String,
    pub locked: bool,
}

/// Insert payload for a new user; PII already encrypted.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: String,
    pub phone: Option<String>,
    pub email: String,
    pub email_lookup: String,
    pub password_hash: String,
}

/// Plaintext signup input.
#[derive(Clone, Deserialize)]
pub struct NewAccount {
    pub first_name: String,
    #[serde(default)]
    pub middle_name: Option<String>,
    pub last_name: String,
    #[serde(default)]
    pub phone: Option<String>,
    pub email: String,
    pub password: String,
}

impl std::fmt::Debug for NewAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewAccount")
            .field("first_name", &self.first_name)
            .field("last_name", &self.last_name)
            .finish_non_exhaustive()
    }
}

/// Plaintext profile change from the account owner.
///
/// Absent fields stay as they are. An empty middle name or phone clears it.
#[derive(Clone, Default, Deserialize)]
pub struct ProfileUpdate {
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub middle_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

impl std::fmt::Debug for ProfileUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileUpdate")
            .field("first_name", &self.first_name)
            .field("last_name", &self.last_name)
            .field("phone", &self.phone.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

/// New values for the editable user columns; phone already encrypted.
#[derive(Debug, Clone)]
pub struct UserUpdate {
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: String,
    pub phone: Option<String>,
}

/// Decrypted view of a user.
#[derive(Debug, Clone, Serialize)]
pub struct Profile {
    pub id: Uuid,
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: String,
    pub phone: Option<String>,
    pub email: String,
    pub roles: Vec<Role>,
    pub locked: bool,
}

/// JWT claims embedded in access tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    #[serde(rename = "iss")]
    pub issuer: String,
    /// Issued at (unix timestamp).
    #[serde(rename = "iat")]
    pub issued_at: i64,
    /// Expiry (unix timestamp).
    #[serde(rename = "exp")]
    pub expire_at: i64,
    /// Subject, the user id.
    #[serde(rename = "sub")]
    pub subject: Uuid,
    #[serde(rename = "jti")]
    pub token_id: Uuid,
    /// Sorted role keys.
    pub role: Vec<Role>,
    /// Sorted permission keys frozen at issuance.
    pub permissions: Vec<Permission>,
    /// Refresh-token family the token was minted from.
    #[serde(rename = "fid")]
    pub family_id: Uuid,
}

impl AccessClaims {
    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.binary_search(&permission).is_ok()
    }

    /// Fail with `PermissionDenied` unless the token carries `permission`.
    pub fn require(&self, permission: Permission) -> Result<(), AuthError> {
        if self.has_permission(permission) {
            Ok(())
        } else {
            Err(AuthError::PermissionDenied(permission))
        }
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.expire_at, 0)
    }
}

/// Access half of a token pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedAccessToken {
    pub value: String,
    pub expire_at: DateTime<Utc>,
}

/// Refresh half of a token pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedRefreshToken {
    pub value: String,
    pub expire_at: DateTime<Utc>,
    pub refresh_link: String,
}

/// Token pair returned by login and refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: IssuedAccessToken,
    pub refresh_token: IssuedRefreshToken,
}

/// Refresh token digest row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshTokenRecord {
    pub token_hash: String,
    pub family_id: Uuid,
    pub generation: i64,
    pub expires_at: DateTime<Utc>,
}

/// Head state of a refresh-token family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenFamily {
    pub id: Uuid,
    pub user_id: Uuid,
    pub generation: i64,
    pub revoked: bool,
}

/// Verification key as published to other services.
#[derive(Debug, Clone, Serialize)]
pub struct PublishedKey {
    pub kid: String,
    pub algorithm: String,
    /// SPKI PEM for asymmetric keys; absent for shared-secret keys.
    pub public_key: Option<String>,
    pub current: bool,
}
