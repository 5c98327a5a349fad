use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use gatekeeper_core::RequestContext;

use super::{OutboxError, OutboxEvent, OutboxRepository, OutboxStatus};
use crate::uow::{InMemoryDatabase, InMemoryStoreError, InMemoryTransaction, TxHandle};

pub const OUTBOX_TABLE: &str = "outbox_events";

impl From<InMemoryStoreError> for OutboxError {
    fn from(err: InMemoryStoreError) -> Self {
        OutboxError::Storage(err.to_string())
    }
}

/// Outbox rows in an [`InMemoryDatabase`] table.
#[derive(Debug, Clone)]
pub struct InMemoryOutboxRepository {
    db: InMemoryDatabase,
}

impl InMemoryOutboxRepository {
    pub fn new(db: InMemoryDatabase) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &InMemoryDatabase {
        &self.db
    }

    fn rows_with_status(&self, status: OutboxStatus) -> Result<Vec<OutboxEvent>, OutboxError> {
        let mut rows: Vec<OutboxEvent> = self
            .db
            .scan::<OutboxEvent>(OUTBOX_TABLE)?
            .into_iter()
            .filter(|row| row.status == status)
            .collect();
        sort_oldest_first(&mut rows);
        Ok(rows)
    }

    fn transition<R>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut OutboxEvent) -> Result<R, OutboxError>,
    ) -> Result<R, OutboxError> {
        self.db
            .modify(OUTBOX_TABLE, &id.to_string(), f)?
            .ok_or(OutboxError::NotFound(id))
    }
}

fn sort_oldest_first(rows: &mut [OutboxEvent]) {
    rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}

#[async_trait]
impl OutboxRepository for InMemoryOutboxRepository {
    type Tx = InMemoryTransaction;

    async fn insert_tx(
        &self,
        ctx: &RequestContext,
        tx: &TxHandle<Self::Tx>,
        event: OutboxEvent,
    ) -> Result<(), OutboxError> {
        ctx.check()?;
        let mut tx = tx.lock().await?;
        tx.insert(OUTBOX_TABLE, &event.id.to_string(), &event)?;
        Ok(())
    }

    async fn fetch_pending(&self, ctx: &RequestContext, limit: usize) -> Result<Vec<OutboxEvent>, OutboxError> {
        ctx.check()?;
        let mut rows = self.rows_with_status(OutboxStatus::Pending)?;
        rows.truncate(limit);
        Ok(rows)
    }

    async fn claim_pending(
        &self,
        ctx: &RequestContext,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxEvent>, OutboxError> {
        ctx.check()?;
        let now = Utc::now();

        self.db.with_table_mut(OUTBOX_TABLE, |table| {
            let mut candidates = Vec::new();
            for value in table.values() {
                let row: OutboxEvent = serde_json::from_value(value.clone())
                    .map_err(|e| OutboxError::Storage(e.to_string()))?;
                if row.is_claimable(now) {
                    candidates.push(row);
                }
            }
            sort_oldest_first(&mut candidates);
            candidates.truncate(limit);

            for row in &mut candidates {
                row.claim(now, lease);
                let value = serde_json::to_value(&*row).map_err(|e| OutboxError::Storage(e.to_string()))?;
                table.insert(row.id.to_string(), value);
            }
            Ok(candidates)
        })
    }

    async fn mark_sent(&self, ctx: &RequestContext, id: Uuid) -> Result<(), OutboxError> {
        ctx.check()?;
        self.transition(id, |row| row.mark_sent(Utc::now()))
    }

    async fn mark_failed(&self, ctx: &RequestContext, id: Uuid, error: &str) -> Result<u32, OutboxError> {
        ctx.check()?;
        self.transition(id, |row| row.mark_failed(error, Utc::now()))
    }

    async fn dead_letter(&self, ctx: &RequestContext, id: Uuid) -> Result<(), OutboxError> {
        ctx.check()?;
        self.transition(id, OutboxEvent::dead_letter)
    }

    async fn fetch_failed(&self, ctx: &RequestContext, limit: usize) -> Result<Vec<OutboxEvent>, OutboxError> {
        ctx.check()?;
        let mut rows = self.rows_with_status(OutboxStatus::Failed)?;
        rows.truncate(limit);
        Ok(rows)
    }

    async fn requeue(&self, ctx: &RequestContext, id: Uuid) -> Result<(), OutboxError> {
        ctx.check()?;
        self.transition(id, OutboxEvent::requeue)
    }

    async fn get(&self, ctx: &RequestContext, id: Uuid) -> Result<Option<OutboxEvent>, OutboxError> {
        ctx.check()?;
        Ok(self.db.get(OUTBOX_TABLE, &id.to_string())?)
    }
}
