//! Postgres-backed users (`users`, see `migrations/`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use gatekeeper_core::{AggregateRoot, DomainError, RequestContext};
use gatekeeper_infra::TxHandle;

use super::UserRepository;
use crate::error::AuthError;
use crate::user::{Email, PasswordHash, User, UserId, UserRecord};

const COLUMNS: &str = "id, email, password_hash, created_at, last_login_at, password_changed_at, version";

#[derive(Debug, Clone)]
pub struct PostgresUserRepository {
    pool: PgPool,
}

impl PostgresUserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn version_param(version: u64) -> Result<i64, AuthError> {
    i64::try_from(version).map_err(|_| AuthError::Storage(format!("version {version} out of range")))
}

#[async_trait]
impl UserRepository for PostgresUserRepository {
    type Tx = Transaction<'static, Postgres>;

    #[instrument(skip(self, ctx, tx, user), fields(user_id = %user.id()), err)]
    async fn save(&self, ctx: &RequestContext, tx: &TxHandle<Self::Tx>, user: &User) -> Result<(), AuthError> {
        ctx.check()?;
        let record = user.to_record();
        let mut guard = tx.lock().await?;

        let inserted = sqlx::query(&format!(
            "INSERT INTO users ({COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7)"
        ))
        .bind(*record.id.as_uuid())
        .bind(record.email.as_str())
        .bind(record.password_hash.as_str())
        .bind(record.created_at)
        .bind(record.last_login_at)
        .bind(record.password_changed_at)
        .bind(version_param(record.version)?)
        .execute(&mut **guard)
        .await;

        match inserted {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(AuthError::EmailTaken(record.email.to_string()))
            }
            Err(err) => Err(map_sqlx_error("save", err)),
        }
    }

    /// Guarded `UPDATE ... WHERE version = $n`; email is never rewritten.
    #[instrument(skip(self, ctx, tx, user), fields(user_id = %user.id()), err)]
    async fn update(&self, ctx: &RequestContext, tx: &TxHandle<Self::Tx>, user: &User) -> Result<(), AuthError> {
        ctx.check()?;
        let record = user.to_record();
        let expected = user.persisted_version();
        let mut guard = tx.lock().await?;

        let updated = sqlx::query(
            "UPDATE users \
             SET password_hash = $2, last_login_at = $3, password_changed_at = $4, version = $5 \
             WHERE id = $1 AND version = $6",
        )
        .bind(*record.id.as_uuid())
        .bind(record.password_hash.as_str())
        .bind(record.last_login_at)
        .bind(record.password_changed_at)
        .bind(version_param(record.version)?)
        .bind(version_param(expected)?)
        .execute(&mut **guard)
        .await
        .map_err(|e| map_sqlx_error("update", e))?;

        if updated.rows_affected() == 1 {
            return Ok(());
        }

        let stored: Option<i64> = sqlx::query_scalar("SELECT version FROM users WHERE id = $1")
            .bind(*record.id.as_uuid())
            .fetch_optional(&mut **guard)
            .await
            .map_err(|e| map_sqlx_error("version lookup", e))?;
        match stored {
            None => Err(AuthError::UserNotFound(record.id)),
            Some(actual) => Err(DomainError::conflict(format!(
                "user {} is at version {actual}, expected {expected}",
                record.id
            ))
            .into()),
        }
    }

    async fn find_by_id(&self, ctx: &RequestContext, id: UserId) -> Result<Option<User>, AuthError> {
        ctx.check()?;
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM users WHERE id = $1"))
            .bind(*id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_id", e))?;

        row.as_ref()
            .map(|row| row_to_record(row).map(User::restore))
            .transpose()
    }

    async fn find_by_email(&self, ctx: &RequestContext, email: &Email) -> Result<Option<User>, AuthError> {
        ctx.check()?;
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM users WHERE email = $1"))
            .bind(email.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_email", e))?;

        row.as_ref()
            .map(|row| row_to_record(row).map(User::restore))
            .transpose()
    }
}

struct UserRow {
    id: Uuid,
    email: String,
    password_hash: String,
    created_at: DateTime<Utc>,
    last_login_at: Option<DateTime<Utc>>,
    password_changed_at: Option<DateTime<Utc>>,
    version: i64,
}

impl<'r> sqlx::FromRow<'r, PgRow> for UserRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(UserRow {
            id: row.try_get("id")?,
            email: row.try_get("email")?,
            password_hash: row.try_get("password_hash")?,
            created_at: row.try_get("created_at")?,
            last_login_at: row.try_get("last_login_at")?,
            password_changed_at: row.try_get("password_changed_at")?,
            version: row.try_get("version")?,
        })
    }
}

impl TryFrom<UserRow> for UserRecord {
    type Error = AuthError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        Ok(UserRecord {
            id: UserId::from_uuid(row.id),
            email: Email::parse(&row.email)?,
            password_hash: PasswordHash::new(row.password_hash),
            created_at: row.created_at,
            last_login_at: row.last_login_at,
            password_changed_at: row.password_changed_at,
            version: u64::try_from(row.version)
                .map_err(|_| AuthError::Storage(format!("negative version {}", row.version)))?,
        })
    }
}

fn row_to_record(row: &PgRow) -> Result<UserRecord, AuthError> {
    let row = <UserRow as sqlx::FromRow<PgRow>>::from_row(row)
        .map_err(|e| AuthError::Storage(format!("failed to decode user row: {e}")))?;
    UserRecord::try_from(row)
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> AuthError {
    match err {
        sqlx::Error::Database(db_err) => {
            AuthError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolTimedOut => AuthError::Storage(format!("connection pool timed out in {operation}")),
        other => AuthError::Storage(format!("{operation} failed: {other}")),
    }
}
