//! Auth-related database queries.
//!
//! PostgreSQL implementations of [`CredentialStore`] and [`FamilyStore`], plus
//! the boot-time catalog check.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::error;
use uuid::Uuid;

use super::AuthError;
use super::families::{FamilyStore, PurgeReport, RotateOutcome};
use super::permissions::{Permission, Role};
use super::store::CredentialStore;
use crate::db::DbPool;
use crate::models::auth::{NewUser, RefreshTokenRecord, StoredUser, TokenFamily, UserUpdate};

type UserRow = (
    Uuid,
    String,
    Option<String>,
    String,
    Option<String>,
    String,
    String,
    String,
    bool,
);

const USER_COLUMNS: &str = "id, first_name, middle_name, last_name, phone, email, email_lookup, \
                            password, locked_at IS NOT NULL";

fn user_from_row(row: UserRow) -> StoredUser {
    let (id, first_name, middle_name, last_name, phone, email, email_lookup, password_hash, locked) =
        row;
    StoredUser {
        id,
        first_name,
        middle_name,
        last_name,
        phone,
        email,
        email_lookup,
        password_hash,
        locked,
    }
}

fn parse_keys<T>(keys: Vec<String>) -> Result<Vec<T>, AuthError>
where
    T: std::str::FromStr<Err = AuthError>,
{
    keys.iter().map(|k| k.parse()).collect()
}

/// Credential store backed by PostgreSQL.
#[derive(Clone)]
pub struct PgCredentialStore {
    db: DbPool,
}

impl PgCredentialStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn find_user_by_lookup(
        &self,
        email_lookup: &str,
    ) -> Result<Option<StoredUser>, AuthError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email_lookup = $1"
        ))
        .bind(email_lookup)
        .fetch_optional(&self.db.get())
        .await?;
        Ok(row.map(user_from_row))
    }

    async fn get_user(&self, user_id: Uuid) -> Result<Option<StoredUser>, AuthError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.db.get())
        .await?;
        Ok(row.map(user_from_row))
    }

    async fn create_user(&self, user: NewUser) -> Result<Uuid, AuthError> {
        let result = sqlx::query_scalar::<_, Uuid>(
            "INSERT INTO users \
               (first_name, middle_name, last_name, phone, email, email_lookup, password) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING id",
        )
        .bind(&user.first_name)
        .bind(&user.middle_name)
        .bind(&user.last_name)
        .bind(&user.phone)
        .bind(&user.email)
        .bind(&user.email_lookup)
        .bind(&user.password_hash)
        .fetch_one(&self.db.get())
        .await;
        match result {
            Ok(id) => Ok(id),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(AuthError::Validation("Email already registered".into()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_user(&self, user_id: Uuid, update: UserUpdate) -> Result<(), AuthError> {
        let result = sqlx::query(
            "UPDATE users SET first_name = $2, middle_name = $3, last_name = $4, phone = $5 \
             WHERE id = $1",
        )
        .bind(user_id)
        .bind(&update.first_name)
        .bind(&update.middle_name)
        .bind(&update.last_name)
        .bind(&update.phone)
        .execute(&self.db.get())
        .await?;
        if result.rows_affected() == 0 {
            return Err(AuthError::UserNotFound);
        }
        Ok(())
    }

    async fn set_locked(&self, user_id: Uuid, locked: bool) -> Result<(), AuthError> {
        let result = sqlx::query(
            "UPDATE users \
             SET locked_at = CASE WHEN $2 THEN COALESCE(locked_at, now()) ELSE NULL END \
             WHERE id = $1",
        )
        .bind(user_id)
        .bind(locked)
        .execute(&self.db.get())
        .await?;
        if result.rows_affected() == 0 {
            return Err(AuthError::UserNotFound);
        }
        Ok(())
    }

    async fn user_roles(&self, user_id: Uuid) -> Result<Vec<Role>, AuthError> {
        let keys = sqlx::query_scalar::<_, String>(
            "SELECT role_key FROM users_to_roles WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.db.get())
        .await?;
        parse_keys(keys)
    }

    async fn assign_role(&self, user_id: Uuid, role: Role) -> Result<(), AuthError> {
        let result = sqlx::query(
            "INSERT INTO users_to_roles (user_id, role_key) VALUES ($1, $2) \
             ON CONFLICT DO NOTHING",
        )
        .bind(user_id)
        .bind(role.as_str())
        .execute(&self.db.get())
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_foreign_key_violation() => {
                Err(AuthError::UserNotFound)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn permissions_for_roles(&self, roles: &[Role]) -> Result<Vec<Permission>, AuthError> {
        let role_keys: Vec<String> = roles.iter().map(|r| r.as_str().to_string()).collect();
        let keys = sqlx::query_scalar::<_, String>(
            "SELECT permission_key FROM permissions_to_roles WHERE role_key = ANY($1)",
        )
        .bind(role_keys)
        .fetch_all(&self.db.get())
        .await?;
        parse_keys(keys)
    }

    async fn default_roles(&self) -> Result<Vec<Role>, AuthError> {
        let keys = sqlx::query_scalar::<_, String>("SELECT key FROM roles WHERE is_default")
            .fetch_all(&self.db.get())
            .await?;
        parse_keys(keys)
    }
}

/// Refresh-token family store backed by PostgreSQL.
#[derive(Clone)]
pub struct PgFamilyStore {
    db: DbPool,
}

impl PgFamilyStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl FamilyStore for PgFamilyStore {
    async fn create_family(
        &self,
        user_id: Uuid,
        first: RefreshTokenRecord,
    ) -> Result<(), AuthError> {
        let mut tx = self.db.get().begin().await?;
        sqlx::query("INSERT INTO token_families (id, user_id, generation) VALUES ($1, $2, $3)")
            .bind(first.family_id)
            .bind(user_id)
            .bind(first.generation)
            .execute(&mut *tx)
            .await?;
        insert_token(&mut tx, &first).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<(RefreshTokenRecord, TokenFamily)>, AuthError> {
        let row = sqlx::query_as::<_, (String, Uuid, i64, DateTime<Utc>, Uuid, i64, bool)>(
            "SELECT rt.token_hash, rt.family_id, rt.generation, rt.expires_at, \
                    f.user_id, f.generation, f.revoked_at IS NOT NULL \
             FROM refresh_tokens rt \
             JOIN token_families f ON f.id = rt.family_id \
             WHERE rt.token_hash = $1",
        )
        .bind(token_hash)
        .fetch_optional(&self.db.get())
        .await?;
        Ok(row.map(
            |(token_hash, family_id, generation, expires_at, user_id, head, revoked)| {
                (
                    RefreshTokenRecord {
                        token_hash,
                        family_id,
                        generation,
                        expires_at,
                    },
                    TokenFamily {
                        id: family_id,
                        user_id,
                        generation: head,
                        revoked,
                    },
                )
            },
        ))
    }

    async fn rotate(
        &self,
        family_id: Uuid,
        expected: i64,
        next: RefreshTokenRecord,
    ) -> Result<RotateOutcome, AuthError> {
        let mut tx = self.db.get().begin().await?;
        let head = sqlx::query_as::<_, (i64, bool)>(
            "SELECT generation, revoked_at IS NOT NULL FROM token_families \
             WHERE id = $1 FOR UPDATE",
        )
        .bind(family_id)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match head {
            None => RotateOutcome::Missing,
            Some((_, true)) => RotateOutcome::Revoked,
            Some((generation, false)) if generation != expected => {
                sqlx::query("UPDATE token_families SET revoked_at = now() WHERE id = $1")
                    .bind(family_id)
                    .execute(&mut *tx)
                    .await?;
                RotateOutcome::Stale { head: generation }
            }
            Some(_) => {
                let advanced = sqlx::query(
                    "UPDATE token_families SET generation = $3 \
                     WHERE id = $1 AND generation = $2 AND revoked_at IS NULL",
                )
                .bind(family_id)
                .bind(expected)
                .bind(next.generation)
                .execute(&mut *tx)
                .await?;
                if advanced.rows_affected() != 1 {
                    return Err(AuthError::Internal(format!(
                        "family {family_id} changed under row lock"
                    )));
                }
                insert_token(&mut tx, &next).await?;
                RotateOutcome::Rotated
            }
        };
        tx.commit().await?;
        Ok(outcome)
    }

    async fn revoke_family(&self, family_id: Uuid) -> Result<bool, AuthError> {
        let result = sqlx::query(
            "UPDATE token_families SET revoked_at = now() WHERE id = $1 AND revoked_at IS NULL",
        )
        .bind(family_id)
        .execute(&self.db.get())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn active_families(&self, user_id: Uuid) -> Result<Vec<Uuid>, AuthError> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM token_families WHERE user_id = $1 AND revoked_at IS NULL",
        )
        .bind(user_id)
        .fetch_all(&self.db.get())
        .await?;
        Ok(ids)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<PurgeReport, AuthError> {
        let mut tx = self.db.get().begin().await?;
        let tokens = sqlx::query(
            "DELETE FROM refresh_tokens rt \
             WHERE rt.expires_at <= $1 \
                OR EXISTS (SELECT 1 FROM token_families f \
                           WHERE f.id = rt.family_id AND f.revoked_at IS NOT NULL)",
        )
        .bind(now)
        .execute(&mut *tx)
        .await?;
        let families = sqlx::query(
            "DELETE FROM token_families f \
             WHERE f.revoked_at IS NOT NULL \
                OR NOT EXISTS (SELECT 1 FROM refresh_tokens rt WHERE rt.family_id = f.id)",
        )
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(PurgeReport {
            tokens: tokens.rows_affected(),
            families: families.rows_affected(),
        })
    }
}

async fn insert_token(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    record: &RefreshTokenRecord,
) -> Result<(), AuthError> {
    sqlx::query(
        "INSERT INTO refresh_tokens (token_hash, family_id, generation, expires_at) \
         VALUES ($1, $2, $3, $4)",
    )
    .bind(&record.token_hash)
    .bind(record.family_id)
    .bind(record.generation)
    .bind(record.expires_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Refuse to run against a database whose catalog differs from the compiled
/// `Role` and `Permission` enums.
pub async fn verify_catalog(db: &DbPool) -> Result<(), AuthError> {
    let pool = db.get();
    let roles: BTreeSet<(String, bool)> =
        sqlx::query_as::<_, (String, bool)>("SELECT key, is_default FROM roles")
            .fetch_all(&pool)
            .await?
            .into_iter()
            .collect();
    let permissions: BTreeSet<String> =
        sqlx::query_scalar::<_, String>("SELECT key FROM permissions")
            .fetch_all(&pool)
            .await?
            .into_iter()
            .collect();

    let expected_roles: BTreeSet<(String, bool)> = Role::ALL
        .iter()
        .map(|r| (r.as_str().to_string(), r.is_default()))
        .collect();
    let expected_permissions: BTreeSet<String> = Permission::ALL
        .iter()
        .map(|p| p.as_str().to_string())
        .collect();

    let mut problems = Vec::new();
    if roles != expected_roles {
        problems.push(format!(
            "roles: database {roles:?}, compiled {expected_roles:?}"
        ));
    }
    if permissions != expected_permissions {
        problems.push(format!(
            "permissions: database {permissions:?}, compiled {expected_permissions:?}"
        ));
    }
    if problems.is_empty() {
        return Ok(());
    }
    let message = problems.join("; ");
    error!(%message, "role/permission catalog mismatch");
    Err(AuthError::Internal(format!("catalog mismatch: {message}")))
}
