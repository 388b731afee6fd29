use anyhow::Context;
use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool};
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use crate::auth::{
    otp::OtpCode,
    repo_types::{NewUser, User, UserChanges},
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("email already registered")]
    DuplicateEmail,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence for user records. Implementations own the email uniqueness
/// guarantee; callers never lock around it.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Fails with `DuplicateEmail` when the email is taken.
    async fn insert(&self, user: NewUser) -> StoreResult<User>;
    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>>;
    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<User>>;
    /// Replaces (or with `None` clears) the pending OTP. Returns false if the user is gone.
    async fn set_otp(&self, id: Uuid, otp: Option<&OtpCode>) -> StoreResult<bool>;
    /// Atomically checks `code` against the unexpired stored OTP, clears it and
    /// stamps the verification time. `None` when the code does not match.
    async fn consume_otp(&self, id: Uuid, code: &str, now: OffsetDateTime)
        -> StoreResult<Option<User>>;
    async fn update(&self, id: Uuid, changes: &UserChanges) -> StoreResult<Option<User>>;
    /// Returns false if nothing was deleted.
    async fn delete(&self, id: Uuid) -> StoreResult<bool>;
}

const USER_COLUMNS: &str = "id, name, email, password_hash, otp, otp_expires_at, \
                            email_verified_at, created_at, updated_at";

fn map_unique(e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::DuplicateEmail,
        _ => StoreError::Database(e),
    }
}

#[derive(Clone)]
pub struct PgUserStore {
    db: PgPool,
}

impl PgUserStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    /// Connects and brings the schema up to date.
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let db = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("connect to database")?;
        sqlx::migrate!("./migrations")
            .run(&db)
            .await
            .context("run migrations")?;
        info!("database migrations applied");
        Ok(Self::new(db))
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn insert(&self, user: NewUser) -> StoreResult<User> {
        let (otp, otp_expires_at) = match &user.otp {
            Some(o) => (Some(o.code.as_str()), Some(o.expires_at)),
            None => (None, None),
        };
        let sql = format!(
            r#"
            INSERT INTO users (id, name, email, password_hash, otp, otp_expires_at, email_verified_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {USER_COLUMNS}
            "#
        );
        sqlx::query_as::<_, User>(&sql)
            .bind(user.id)
            .bind(&user.name)
            .bind(&user.email)
            .bind(&user.password_hash)
            .bind(otp)
            .bind(otp_expires_at)
            .bind(user.email_verified_at)
            .fetch_one(&self.db)
            .await
            .map_err(map_unique)
    }

    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(email)
            .fetch_optional(&self.db)
            .await?;
        Ok(user)
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        Ok(user)
    }

    async fn set_otp(&self, id: Uuid, otp: Option<&OtpCode>) -> StoreResult<bool> {
        let res = sqlx::query(
            r#"
            UPDATE users
               SET otp = $2, otp_expires_at = $3, updated_at = now()
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(otp.map(|o| o.code.as_str()))
        .bind(otp.map(|o| o.expires_at))
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn consume_otp(
        &self,
        id: Uuid,
        code: &str,
        now: OffsetDateTime,
    ) -> StoreResult<Option<User>> {
        let sql = format!(
            r#"
            UPDATE users
               SET otp = NULL,
                   otp_expires_at = NULL,
                   email_verified_at = COALESCE(email_verified_at, $3),
                   updated_at = now()
             WHERE id = $1 AND otp = $2 AND otp_expires_at > $3
            RETURNING {USER_COLUMNS}
            "#
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .bind(code)
            .bind(now)
            .fetch_optional(&self.db)
            .await?;
        Ok(user)
    }

    async fn update(&self, id: Uuid, changes: &UserChanges) -> StoreResult<Option<User>> {
        let sql = format!(
            r#"
            UPDATE users
               SET name = COALESCE($2, name),
                   email = COALESCE($3, email),
                   password_hash = COALESCE($4, password_hash),
                   updated_at = now()
             WHERE id = $1
            RETURNING {USER_COLUMNS}
            "#
        );
        sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .bind(changes.name.as_deref())
            .bind(changes.email.as_deref())
            .bind(changes.password_hash.as_deref())
            .fetch_optional(&self.db)
            .await
            .map_err(map_unique)
    }

    async fn delete(&self, id: Uuid) -> StoreResult<bool> {
        let res = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(res.rows_affected() > 0)
    }
}
