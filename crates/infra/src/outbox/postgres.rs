//! Postgres-backed outbox (`outbox_events`, see `migrations/`).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use gatekeeper_core::{AggregateId, EventId, RequestContext};

use super::{OutboxError, OutboxEvent, OutboxRepository, OutboxStatus};
use crate::uow::TxHandle;

const COLUMNS: &str = "id, event_id, event_name, aggregate_id, payload, created_at, status, \
                       attempts, last_error, last_attempt_at, sent_at, locked_until";

#[derive(Debug, Clone)]
pub struct PostgresOutboxRepository {
    pool: PgPool,
}

impl PostgresOutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_by_status(
        &self,
        status: OutboxStatus,
        limit: usize,
        operation: &str,
    ) -> Result<Vec<OutboxEvent>, OutboxError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM outbox_events \
             WHERE status = $1 \
             ORDER BY created_at ASC, id ASC \
             LIMIT $2"
        ))
        .bind(status.as_str())
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;

        rows.iter().map(row_to_event).collect()
    }

    /// Explains why a guarded `UPDATE ... WHERE status = from` touched no row.
    async fn rejected_transition(&self, id: Uuid, to: OutboxStatus) -> OutboxError {
        let status: Result<Option<String>, sqlx::Error> =
            sqlx::query_scalar("SELECT status FROM outbox_events WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await;

        match status {
            Ok(None) => OutboxError::NotFound(id),
            Ok(Some(from)) => match from.parse::<OutboxStatus>() {
                Ok(from) => OutboxError::InvalidTransition { id, from, to },
                Err(err) => err,
            },
            Err(err) => map_sqlx_error("status lookup", err),
        }
    }
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[async_trait]
impl OutboxRepository for PostgresOutboxRepository {
    type Tx = Transaction<'static, Postgres>;

    #[instrument(skip(self, ctx, tx, event), fields(event_name = %event.event_name, outbox_id = %event.id), err)]
    async fn insert_tx(
        &self,
        ctx: &RequestContext,
        tx: &TxHandle<Self::Tx>,
        event: OutboxEvent,
    ) -> Result<(), OutboxError> {
        ctx.check()?;
        let mut guard = tx.lock().await?;

        sqlx::query(&format!(
            "INSERT INTO outbox_events ({COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
        ))
        .bind(event.id)
        .bind(*event.event_id.as_uuid())
        .bind(&event.event_name)
        .bind(*event.aggregate_id.as_uuid())
        .bind(&event.payload)
        .bind(event.created_at)
        .bind(event.status.as_str())
        .bind(i32::try_from(event.attempts).unwrap_or(i32::MAX))
        .bind(&event.last_error)
        .bind(event.last_attempt_at)
        .bind(event.sent_at)
        .bind(event.locked_until)
        .execute(&mut **guard)
        .await
        .map_err(|e| map_sqlx_error("insert_tx", e))?;

        Ok(())
    }

    async fn fetch_pending(&self, ctx: &RequestContext, limit: usize) -> Result<Vec<OutboxEvent>, OutboxError> {
        ctx.check()?;
        self.fetch_by_status(OutboxStatus::Pending, limit, "fetch_pending")
            .await
    }

    #[instrument(skip(self, ctx), err)]
    async fn claim_pending(
        &self,
        ctx: &RequestContext,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxEvent>, OutboxError> {
        ctx.check()?;
        let now = Utc::now();
        let lease = chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX);
        let locked_until = now.checked_add_signed(lease).unwrap_or(DateTime::<Utc>::MAX_UTC);

        // SKIP LOCKED keeps concurrent claimers off each other's rows.
        let rows = sqlx::query(&format!(
            "UPDATE outbox_events SET locked_until = $1 \
             WHERE id IN ( \
                 SELECT id FROM outbox_events \
                 WHERE status = 'pending' AND (locked_until IS NULL OR locked_until <= $2) \
                 ORDER BY created_at ASC, id ASC \
                 LIMIT $3 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {COLUMNS}"
        ))
        .bind(locked_until)
        .bind(now)
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_pending", e))?;

        let mut claimed: Vec<OutboxEvent> = rows.iter().map(row_to_event).collect::<Result<_, _>>()?;
        claimed.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(claimed)
    }

    async fn mark_sent(&self, ctx: &RequestContext, id: Uuid) -> Result<(), OutboxError> {
        ctx.check()?;
        let result = sqlx::query(
            "UPDATE outbox_events SET status = 'sent', sent_at = $2, locked_until = NULL \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_sent", e))?;

        if result.rows_affected() == 0 {
            return Err(self.rejected_transition(id, OutboxStatus::Sent).await);
        }
        Ok(())
    }

    async fn mark_failed(&self, ctx: &RequestContext, id: Uuid, error: &str) -> Result<u32, OutboxError> {
        ctx.check()?;
        let attempts: Option<i32> = sqlx::query_scalar(
            "UPDATE outbox_events \
             SET attempts = attempts + 1, last_error = $2, last_attempt_at = $3, locked_until = NULL \
             WHERE id = $1 AND status = 'pending' \
             RETURNING attempts",
        )
        .bind(id)
        .bind(error)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_failed", e))?;

        match attempts {
            Some(attempts) => Ok(u32::try_from(attempts).unwrap_or(0)),
            None => Err(self.rejected_transition(id, OutboxStatus::Pending).await),
        }
    }

    async fn dead_letter(&self, ctx: &RequestContext, id: Uuid) -> Result<(), OutboxError> {
        ctx.check()?;
        let result = sqlx::query(
            "UPDATE outbox_events SET status = 'failed', locked_until = NULL \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("dead_letter", e))?;

        if result.rows_affected() == 0 {
            return Err(self.rejected_transition(id, OutboxStatus::Failed).await);
        }
        Ok(())
    }

    async fn fetch_failed(&self, ctx: &RequestContext, limit: usize) -> Result<Vec<OutboxEvent>, OutboxError> {
        ctx.check()?;
        self.fetch_by_status(OutboxStatus::Failed, limit, "fetch_failed")
            .await
    }

    async fn requeue(&self, ctx: &RequestContext, id: Uuid) -> Result<(), OutboxError> {
        ctx.check()?;
        let result = sqlx::query(
            "UPDATE outbox_events SET status = 'pending', attempts = 0 \
             WHERE id = $1 AND status = 'failed'",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue", e))?;

        if result.rows_affected() == 0 {
            return Err(self.rejected_transition(id, OutboxStatus::Pending).await);
        }
        Ok(())
    }

    async fn get(&self, ctx: &RequestContext, id: Uuid) -> Result<Option<OutboxEvent>, OutboxError> {
        ctx.check()?;
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM outbox_events WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(row_to_event).transpose()
    }
}

struct OutboxRow {
    id: Uuid,
    event_id: Uuid,
    event_name: String,
    aggregate_id: Uuid,
    payload: Vec<u8>,
    created_at: DateTime<Utc>,
    status: String,
    attempts: i32,
    last_error: Option<String>,
    last_attempt_at: Option<DateTime<Utc>>,
    sent_at: Option<DateTime<Utc>>,
    locked_until: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for OutboxRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(OutboxRow {
            id: row.try_get("id")?,
            event_id: row.try_get("event_id")?,
            event_name: row.try_get("event_name")?,
            aggregate_id: row.try_get("aggregate_id")?,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
            last_attempt_at: row.try_get("last_attempt_at")?,
            sent_at: row.try_get("sent_at")?,
            locked_until: row.try_get("locked_until")?,
        })
    }
}

impl TryFrom<OutboxRow> for OutboxEvent {
    type Error = OutboxError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        Ok(OutboxEvent {
            id: row.id,
            event_id: EventId::from_uuid(row.event_id),
            event_name: row.event_name,
            aggregate_id: AggregateId::from_uuid(row.aggregate_id),
            payload: row.payload,
            created_at: row.created_at,
            status: row.status.parse()?,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            last_error: row.last_error,
            last_attempt_at: row.last_attempt_at,
            sent_at: row.sent_at,
            locked_until: row.locked_until,
        })
    }
}

fn row_to_event(row: &PgRow) -> Result<OutboxEvent, OutboxError> {
    let row = <OutboxRow as sqlx::FromRow<PgRow>>::from_row(row)
        .map_err(|e| OutboxError::Storage(format!("failed to decode outbox row: {e}")))?;
    OutboxEvent::try_from(row)
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> OutboxError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => OutboxError::Storage(format!("duplicate outbox row ({msg})")),
                Some("40001") | Some("40P01") => {
                    OutboxError::Storage(format!("serialization conflict ({msg})"))
                }
                _ => OutboxError::Storage(msg),
            }
        }
        sqlx::Error::PoolTimedOut => OutboxError::Storage(format!("connection pool timed out in {operation}")),
        sqlx::Error::PoolClosed => OutboxError::Storage(format!("connection pool closed in {operation}")),
        other => OutboxError::Storage(format!("{operation} failed: {other}")),
    }
}
