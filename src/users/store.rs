use axum::async_trait;
use sqlx::{FromRow, PgPool};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::error::ApiError;

/// User record. Exactly one persisted entity backs the auth core; every
/// created user carries at least one of `password_hash` / `google_id`.
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub password_hash: Option<String>,
    pub google_id: Option<String>,
    pub name: Option<String>,
    pub profile_picture: Option<String>,
    pub phone_number: Option<String>,
    pub address: Option<String>,
    pub date_of_birth: Option<Date>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Fields for creating a user. Signup sets `password_hash`; first-time
/// Google sign-in sets `google_id` and leaves the password unset.
#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub email: String,
    pub password_hash: Option<String>,
    pub google_id: Option<String>,
    pub name: Option<String>,
    pub profile_picture: Option<String>,
}

/// Partial update; `None` means "leave unchanged".
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub google_id: Option<String>,
    pub name: Option<String>,
    pub profile_picture: Option<String>,
    pub phone_number: Option<String>,
    pub address: Option<String>,
    pub date_of_birth: Option<Date>,
}

/// User directory. Email is the canonical lookup key and is compared
/// lower-cased; uniqueness of `email` and `google_id` is the store's job
/// (constraints, not in-process locking) so concurrent signups race safely
/// across server instances.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, ApiError>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, ApiError>;
    async fn find_by_google_id(&self, google_id: &str) -> Result<Option<User>, ApiError>;
    async fn create(&self, new_user: NewUser) -> Result<User, ApiError>;
    async fn update(&self, id: Uuid, update: UserUpdate) -> Result<User, ApiError>;
}

const USER_COLUMNS: &str = "id, email, password_hash, google_id, name, profile_picture, \
     phone_number, address, date_of_birth, created_at, updated_at";

#[derive(Clone)]
pub struct PgUserStore {
    pool: PgPool,
}

impl PgUserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, ApiError> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = LOWER($1)"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;
        Ok(user)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, ApiError> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;
        Ok(user)
    }

    async fn find_by_google_id(&self, google_id: &str) -> Result<Option<User>, ApiError> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE google_id = $1"
        ))
        .bind(google_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;
        Ok(user)
    }

    async fn create(&self, new_user: NewUser) -> Result<User, ApiError> {
        let user = sqlx::query_as::<_, User>(&format!(
            r#"
            INSERT INTO users (email, password_hash, google_id, name, profile_picture)
            VALUES (LOWER($1), $2, $3, $4, $5)
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(&new_user.email)
        .bind(&new_user.password_hash)
        .bind(&new_user.google_id)
        .bind(&new_user.name)
        .bind(&new_user.profile_picture)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            // 23505 = unique_violation; the loser of a concurrent signup
            // race lands here instead of the pre-check.
            if let sqlx::Error::Database(db) = &e {
                if db.code().as_deref() == Some("23505") {
                    return ApiError::EmailAlreadyRegistered;
                }
            }
            ApiError::Internal(e.into())
        })?;
        Ok(user)
    }

    async fn update(&self, id: Uuid, update: UserUpdate) -> Result<User, ApiError> {
        let user = sqlx::query_as::<_, User>(&format!(
            r#"
            UPDATE users
            SET google_id = COALESCE($2, google_id),
                name = COALESCE($3, name),
                profile_picture = COALESCE($4, profile_picture),
                phone_number = COALESCE($5, phone_number),
                address = COALESCE($6, address),
                date_of_birth = COALESCE($7, date_of_birth),
                updated_at = now()
            WHERE id = $1
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&update.google_id)
        .bind(&update.name)
        .bind(&update.profile_picture)
        .bind(&update.phone_number)
        .bind(&update.address)
        .bind(update.date_of_birth)
        .fetch_optional(&self.pool)
        .await
        .map_err(anyhow::Error::from)?;
        user.ok_or(ApiError::NotFound)
    }
}

/// In-memory store with the same uniqueness guarantees, used by
/// `AppState::fake()` and the flow tests. The whole map sits behind one
/// mutex, so create is atomic and a concurrent duplicate signup has exactly
/// one winner.
#[derive(Default)]
pub struct MemoryUserStore {
    users: std::sync::Mutex<Vec<User>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, ApiError> {
        let email = email.to_lowercase();
        let users = self.users.lock().unwrap();
        Ok(users.iter().find(|u| u.email == email).cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, ApiError> {
        let users = self.users.lock().unwrap();
        Ok(users.iter().find(|u| u.id == id).cloned())
    }

    async fn find_by_google_id(&self, google_id: &str) -> Result<Option<User>, ApiError> {
        let users = self.users.lock().unwrap();
        Ok(users
            .iter()
            .find(|u| u.google_id.as_deref() == Some(google_id))
            .cloned())
    }

    async fn create(&self, new_user: NewUser) -> Result<User, ApiError> {
        let email = new_user.email.to_lowercase();
        let mut users = self.users.lock().unwrap();
        if users.iter().any(|u| u.email == email) {
            return Err(ApiError::EmailAlreadyRegistered);
        }
        let now = OffsetDateTime::now_utc();
        let user = User {
            id: Uuid::new_v4(),
            email,
            password_hash: new_user.password_hash,
            google_id: new_user.google_id,
            name: new_user.name,
            profile_picture: new_user.profile_picture,
            phone_number: None,
            address: None,
            date_of_birth: None,
            created_at: now,
            updated_at: now,
        };
        users.push(user.clone());
        Ok(user)
    }

    async fn update(&self, id: Uuid, update: UserUpdate) -> Result<User, ApiError> {
        let mut users = self.users.lock().unwrap();
        let user = users
            .iter_mut()
            .find(|u| u.id == id)
            .ok_or(ApiError::NotFound)?;
        if update.google_id.is_some() {
            user.google_id = update.google_id;
        }
        if update.name.is_some() {
            user.name = update.name;
        }
        if update.profile_picture.is_some() {
            user.profile_picture = update.profile_picture;
        }
        if update.phone_number.is_some() {
            user.phone_number = update.phone_number;
        }
        if update.address.is_some() {
            user.address = update.address;
        }
        if update.date_of_birth.is_some() {
            user.date_of_birth = update.date_of_birth;
        }
        user.updated_at = OffsetDateTime::now_utc();
        Ok(user.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_user(email: &str) -> NewUser {
        NewUser {
            email: email.into(),
            password_hash: Some("hash".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_rejects_duplicate_email() {
        let store = MemoryUserStore::new();
        store.create(new_user("a@test.com")).await.expect("create");
        let err = store.create(new_user("a@test.com")).await.unwrap_err();
        assert!(matches!(err, ApiError::EmailAlreadyRegistered));
    }

    #[tokio::test]
    async fn email_lookup_is_case_insensitive() {
        let store = MemoryUserStore::new();
        store.create(new_user("A@Test.com")).await.expect("create");
        let found = store.find_by_email("a@test.com").await.expect("lookup");
        assert!(found.is_some());
        assert_eq!(found.unwrap().email, "a@test.com");
    }

    #[tokio::test]
    async fn find_by_google_id_resolves_linked_user() {
        let store = MemoryUserStore::new();
        let created = store
            .create(NewUser {
                email: "g@test.com".into(),
                google_id: Some("google-123".into()),
                ..Default::default()
            })
            .await
            .expect("create");
        let found = store
            .find_by_google_id("google-123")
            .await
            .expect("lookup")
            .expect("linked user");
        assert_eq!(found.id, created.id);
        assert!(store
            .find_by_google_id("google-999")
            .await
            .expect("lookup")
            .is_none());
    }

    #[tokio::test]
    async fn update_is_partial() {
        let store = MemoryUserStore::new();
        let user = store
            .create(NewUser {
                email: "b@test.com".into(),
                password_hash: Some("hash".into()),
                name: Some("Original".into()),
                ..Default::default()
            })
            .await
            .expect("create");

        let updated = store
            .update(
                user.id,
                UserUpdate {
                    phone_number: Some("+123456".into()),
                    ..Default::default()
                },
            )
            .await
            .expect("update");

        assert_eq!(updated.name.as_deref(), Some("Original"));
        assert_eq!(updated.phone_number.as_deref(), Some("+123456"));
        assert_eq!(updated.password_hash.as_deref(), Some("hash"));
        assert!(updated.updated_at >= user.updated_at);
    }

    #[tokio::test]
    async fn update_unknown_id_is_not_found() {
        let store = MemoryUserStore::new();
        let err = store
            .update(Uuid::new_v4(), UserUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound));
    }

    #[tokio::test]
    async fn concurrent_duplicate_creates_have_one_winner() {
        let store = std::sync::Arc::new(MemoryUserStore::new());
        let (a, b) = tokio::join!(
            store.create(new_user("race@test.com")),
            store.create(new_user("race@test.com")),
        );
        assert!(
            a.is_ok() != b.is_ok(),
            "exactly one create must win: {a:?} / {b:?}"
        );
        let loser = if a.is_err() { a } else { b };
        assert!(matches!(loser.unwrap_err(), ApiError::EmailAlreadyRegistered));
    }
}
