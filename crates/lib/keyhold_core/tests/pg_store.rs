//! PostgreSQL store tests.
//!
//! Each test migrates a throwaway schema on the server named by
//! `DATABASE_URL` and drops it afterwards. Without `DATABASE_URL` the tests
//! return early.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{Duration, Utc};
use keyhold_core::auth::AuthError;
use keyhold_core::auth::families::{
    FamilyStore, PurgeReport, RotateOutcome, generate_refresh_token, hash_refresh_token,
};
use keyhold_core::auth::permissions::Role;
use keyhold_core::auth::queries::{PgCredentialStore, PgFamilyStore, verify_catalog};
use keyhold_core::auth::store::CredentialStore;
use keyhold_core::db::{DbPool, DbSettings};
use keyhold_core::models::auth::{NewUser, RefreshTokenRecord, UserUpdate};
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use uuid::Uuid;

struct TestDb {
    admin: PgPool,
    schema: String,
    db: DbPool,
}

impl TestDb {
    async fn start() -> Option<Self> {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            eprintln!("DATABASE_URL not set, skipping PostgreSQL test");
            return None;
        };
        let admin = PgPool::connect(&url).await.expect("connect admin pool");
        let schema = format!("t_{}", Uuid::new_v4().simple());
        sqlx::query(&format!("CREATE SCHEMA {schema}"))
            .execute(&admin)
            .await
            .expect("create schema");

        let options = PgConnectOptions::from_str(&url)
            .expect("parse DATABASE_URL")
            .options([("search_path", schema.as_str())]);
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .expect("connect test pool");
        keyhold_core::migrate::migrate(&pool)
            .await
            .expect("migrate");

        Some(Self {
            admin,
            schema,
            db: DbPool::from_pool(DbSettings::new(url), pool),
        })
    }

    fn credentials(&self) -> PgCredentialStore {
        PgCredentialStore::new(self.db.clone())
    }

    fn families(&self) -> PgFamilyStore {
        PgFamilyStore::new(self.db.clone())
    }

    async fn user(&self, lookup: &str) -> Uuid {
        self.credentials()
            .create_user(new_user(lookup))
            .await
            .expect("create user")
    }

    async fn finish(self) {
        self.db.close().await;
        sqlx::query(&format!("DROP SCHEMA {} CASCADE", self.schema))
            .execute(&self.admin)
            .await
            .expect("drop schema");
        self.admin.close().await;
    }
}

fn new_user(lookup: &str) -> NewUser {
    NewUser {
        first_name: "Anna".into(),
        middle_name: None,
        last_name: "Petrova".into(),
        phone: Some("phone-ciphertext".into()),
        email: "email-ciphertext".into(),
        email_lookup: lookup.into(),
        password_hash: "hash".into(),
    }
}

fn record(family_id: Uuid, generation: i64) -> RefreshTokenRecord {
    RefreshTokenRecord {
        token_hash: hash_refresh_token(&generate_refresh_token()),
        family_id,
        generation,
        expires_at: Utc::now() + Duration::days(1),
    }
}

#[tokio::test]
async fn family_rotates_then_stale_presentation_revokes_it() {
    let Some(t) = TestDb::start().await else {
        return;
    };
    let user = t.user("rotate").await;
    let store = t.families();
    let family = Uuid::new_v4();
    let first = record(family, 0);
    store.create_family(user, first.clone()).await.unwrap();

    let (found, head) = store.find_token(&first.token_hash).await.unwrap().unwrap();
    assert_eq!(found.generation, 0);
    assert_eq!(head.user_id, user);
    assert!(!head.revoked);

    let second = record(family, 1);
    assert_eq!(
        store.rotate(family, 0, second.clone()).await.unwrap(),
        RotateOutcome::Rotated
    );
    let (_, head) = store.find_token(&second.token_hash).await.unwrap().unwrap();
    assert_eq!(head.generation, 1);

    assert_eq!(
        store.rotate(family, 0, record(family, 1)).await.unwrap(),
        RotateOutcome::Stale { head: 1 }
    );
    let (_, head) = store.find_token(&second.token_hash).await.unwrap().unwrap();
    assert!(head.revoked);
    assert_eq!(
        store.rotate(family, 1, record(family, 2)).await.unwrap(),
        RotateOutcome::Revoked
    );
    assert!(store.active_families(user).await.unwrap().is_empty());
    assert_eq!(
        store.rotate(Uuid::new_v4(), 0, record(family, 1)).await.unwrap(),
        RotateOutcome::Missing
    );

    t.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_rotations_have_one_winner() {
    let Some(t) = TestDb::start().await else {
        return;
    };
    let user = t.user("race").await;
    let store = Arc::new(t.families());
    let family = Uuid::new_v4();
    store.create_family(user, record(family, 0)).await.unwrap();

    let attempts: Vec<_> = (0..8)
        .map(|_| {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.rotate(family, 0, record(family, 1)).await })
        })
        .collect();
    let mut rotated = 0;
    for attempt in attempts {
        match attempt.await.unwrap().unwrap() {
            RotateOutcome::Rotated => rotated += 1,
            RotateOutcome::Stale { head } => assert_eq!(head, 1),
            RotateOutcome::Revoked => {}
            RotateOutcome::Missing => panic!("family vanished"),
        }
    }
    assert_eq!(rotated, 1);

    let tokens: i64 =
        sqlx::query_scalar("SELECT count(*) FROM refresh_tokens WHERE family_id = $1")
            .bind(family)
            .fetch_one(&t.db.get())
            .await
            .unwrap();
    assert_eq!(tokens, 2);

    t.finish().await;
}

#[tokio::test]
async fn purge_drops_expired_tokens_and_dead_families() {
    let Some(t) = TestDb::start().await else {
        return;
    };
    let user = t.user("purge").await;
    let store = t.families();

    let expired_family = Uuid::new_v4();
    let mut expired = record(expired_family, 0);
    expired.expires_at = Utc::now() - Duration::seconds(1);
    store.create_family(user, expired.clone()).await.unwrap();

    let revoked_family = Uuid::new_v4();
    store
        .create_family(user, record(revoked_family, 0))
        .await
        .unwrap();
    assert!(store.revoke_family(revoked_family).await.unwrap());

    let live_family = Uuid::new_v4();
    let live = record(live_family, 0);
    store.create_family(user, live.clone()).await.unwrap();

    assert_eq!(
        store.purge_expired(Utc::now()).await.unwrap(),
        PurgeReport {
            tokens: 2,
            families: 2
        }
    );
    assert!(store.find_token(&expired.token_hash).await.unwrap().is_none());
    assert!(store.find_token(&live.token_hash).await.unwrap().is_some());

    let families: Vec<Uuid> = sqlx::query_scalar("SELECT id FROM token_families")
        .fetch_all(&t.db.get())
        .await
        .unwrap();
    assert_eq!(families, vec![live_family]);

    t.finish().await;
}

#[tokio::test]
async fn duplicate_email_lookup_is_a_validation_error() {
    let Some(t) = TestDb::start().await else {
        return;
    };
    let store = t.credentials();
    store.create_user(new_user("same")).await.unwrap();
    assert!(matches!(
        store.create_user(new_user("same")).await,
        Err(AuthError::Validation(_))
    ));

    t.finish().await;
}

#[tokio::test]
async fn user_rows_roles_and_updates_round_trip() {
    let Some(t) = TestDb::start().await else {
        return;
    };
    let store = t.credentials();
    let id = t.user("rows").await;

    assert_eq!(store.default_roles().await.unwrap(), vec![Role::User]);
    store.assign_role(id, Role::User).await.unwrap();
    store.assign_role(id, Role::User).await.unwrap();
    assert_eq!(store.user_roles(id).await.unwrap(), vec![Role::User]);

    store
        .update_user(
            id,
            UserUpdate {
                first_name: "Anya".into(),
                middle_name: Some("Sergeevna".into()),
                last_name: "Petrova".into(),
                phone: None,
            },
        )
        .await
        .unwrap();
    store.set_locked(id, true).await.unwrap();

    let user = store.find_user_by_lookup("rows").await.unwrap().unwrap();
    assert_eq!(user.first_name, "Anya");
    assert_eq!(user.middle_name.as_deref(), Some("Sergeevna"));
    assert_eq!(user.phone, None);
    assert_eq!(user.email, "email-ciphertext");
    assert!(user.locked);

    let ghost = Uuid::new_v4();
    assert!(matches!(
        store.set_locked(ghost, true).await,
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

    t.finish().await;
}

#[tokio::test]
async fn catalog_check_rejects_a_drifted_database() {
    let Some(t) = TestDb::start().await else {
        return;
    };
    verify_catalog(&t.db).await.unwrap();

    sqlx::query("UPDATE roles SET is_default = TRUE WHERE key = 'admin'")
        .execute(&t.db.get())
        .await
        .unwrap();
    match verify_catalog(&t.db).await {
        Err(AuthError::Internal(message)) => assert!(message.contains("catalog mismatch")),
        other => panic!("expected catalog mismatch, got {other:?}"),
    }

    t.finish().await;
}
