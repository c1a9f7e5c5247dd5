//! Closed role/permission catalog and permission resolution.
//!
//! Role and permission keys ship with the service as enums; a key that is not
//! declared here cannot be parsed, stored or placed in a token. Variants are
//! declared in lexical order of their keys so that the derived `Ord` gives the
//! same ordering as sorting the key strings.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use super::AuthError;
use super::store::CredentialStore;

/// Atomic capability. Always granted through a [`Role`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ManageUsers,
    ModerateComments,
    ReadSomeData,
    UploadVideo,
    ViewStatistics,
    WriteComments,
    WriteOtherData,
}

impl Permission {
    pub const ALL: [Permission; 7] = [
        Permission::ManageUsers,
        Permission::ModerateComments,
        Permission::ReadSomeData,
        Permission::UploadVideo,
        Permission::ViewStatistics,
        Permission::WriteComments,
        Permission::WriteOtherData,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Permission::ManageUsers => "manage_users",
            Permission::ModerateComments => "moderate_comments",
            Permission::ReadSomeData => "read_some_data",
            Permission::UploadVideo => "upload_video",
            Permission::ViewStatistics => "view_statistics",
            Permission::WriteComments => "write_comments",
            Permission::WriteOtherData => "write_other_data",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Permission::ManageUsers => "Assign roles, lock accounts and revoke tokens",
            Permission::ModerateComments => "Hide or delete comments of other users",
            Permission::ReadSomeData => "Read published content",
            Permission::UploadVideo => "Upload and publish own videos",
            Permission::ViewStatistics => "Read aggregated statistics",
            Permission::WriteComments => "Post comments and likes",
            Permission::WriteOtherData => "Modify content owned by other users",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Permission::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| AuthError::UnknownKey(format!("permission '{s}'")))
    }
}

/// Named bundle of permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Moderator,
    Service,
    User,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Admin, Role::Moderator, Role::Service, Role::User];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Moderator => "moderator",
            Role::Service => "service",
            Role::User => "user",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Role::Admin => "Full data administration",
            Role::Moderator => "Community moderation",
            Role::Service => "Internal service account",
            Role::User => "Regular signed-up user",
        }
    }

    /// Whether the role is flagged `is_default` in the seeded catalog.
    pub fn is_default(self) -> bool {
        matches!(self, Role::User)
    }

    /// Permissions linked to the role by the deploy-time seed.
    pub fn seeded_permissions(self) -> &'static [Permission] {
        match self {
            Role::Admin => &[Permission::ReadSomeData, Permission::WriteOtherData],
            Role::Moderator => &[
                Permission::ModerateComments,
                Permission::ReadSomeData,
                Permission::ViewStatistics,
                Permission::WriteComments,
            ],
            Role::Service => &[
                Permission::ManageUsers,
                Permission::ReadSomeData,
                Permission::ViewStatistics,
            ],
            Role::User => &[
                Permission::ReadSomeData,
                Permission::UploadVideo,
                Permission::WriteComments,
            ],
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| AuthError::UnknownKey(format!("role '{s}'")))
    }
}

/// A user's frozen authority: sorted roles and the sorted union of their
/// permissions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authority {
    pub roles: Vec<Role>,
    pub permissions: Vec<Permission>,
}

/// Aggregates role assignments into deterministic permission sets.
#[derive(Clone)]
pub struct PermissionResolver {
    store: Arc<dyn CredentialStore>,
}

impl PermissionResolver {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    /// Resolve roles and permissions for a user.
    ///
    /// Zero roles on a user that reached this point is an invariant violation:
    /// it is logged and surfaced, never papered over with defaults.
    pub async fn resolve(&self, user_id: Uuid) -> Result<Authority, AuthError> {
        let roles: BTreeSet<Role> = self.store.user_roles(user_id).await?.into_iter().collect();
        if roles.is_empty() {
            error!(%user_id, "user has no role assignment; refusing to resolve permissions");
            return Err(AuthError::UserHasNoRole(user_id));
        }
        let roles: Vec<Role> = roles.into_iter().collect();
        let permissions: BTreeSet<Permission> = self
            .store
            .permissions_for_roles(&roles)
            .await?
            .into_iter()
            .collect();
        Ok(Authority {
            roles,
            permissions: permissions.into_iter().collect(),
        })
    }

    /// Sorted, de-duplicated permission keys implied by the user's roles.
    pub async fn resolve_permissions(&self, user_id: Uuid) -> Result<Vec<Permission>, AuthError> {
        Ok(self.resolve(user_id).await?.permissions)
    }
}
