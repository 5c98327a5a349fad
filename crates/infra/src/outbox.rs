//! Transactional outbox.
//!
//! Events are staged as rows in the same transaction as the aggregate write
//! that produced them, and delivered later by the [`OutboxProcessor`]. Delivery
//! is at-least-once: a row stays `pending` until every matching handler
//! succeeds in one pass.
//!
//! ## Row lifecycle
//!
//! ```text
//!            mark_failed (attempts += 1)
//!              ┌──────┐
//!              ▼      │
//!   insert ─▶ pending ─┴─ mark_sent ─▶ sent        (terminal)
//!              │  ▲
//!  dead_letter │  │ requeue (attempts = 0)
//!              ▼  │
//!             failed
//! ```
//!
//! `failed` is the dead-letter partition: rows land there when they reach the
//! processor's retry cap and leave only through an explicit `requeue`.
//!
//! ## Leasing
//!
//! `claim_pending` stamps `locked_until` on the rows it returns so that a
//! second processor skips them until the lease expires. `mark_*` clear it.

use core::fmt;
use core::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use gatekeeper_core::{AggregateId, ContextError, DomainEvent, EventId, RequestContext};
use gatekeeper_events::SerializationError;

use crate::uow::{TransactionError, TxHandle};

pub mod in_memory;
pub mod postgres;
pub mod processor;
pub mod writer;

pub use in_memory::InMemoryOutboxRepository;
pub use postgres::PostgresOutboxRepository;
pub use processor::{OutboxProcessor, OutboxProcessorConfig, ProcessReport};
pub use writer::OutboxWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Sent,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Sent => "sent",
            OutboxStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = OutboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            other => Err(OutboxError::Storage(format!("unknown outbox status `{other}`"))),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OutboxError {
    #[error("outbox row {0} not found")]
    NotFound(Uuid),

    #[error("outbox row {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: OutboxStatus,
        to: OutboxStatus,
    },

    #[error("outbox storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Context(#[from] ContextError),
}

/// One staged event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub event_id: EventId,
    pub event_name: String,
    pub aggregate_id: AggregateId,
    /// The event as encoded by the `EventSerializer`.
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub locked_until: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    /// A fresh pending row for `event` with its encoded `payload`.
    pub fn pending(event: &DomainEvent, payload: Vec<u8>) -> Self {
        Self {
            id: Uuid::now_v7(),
            event_id: event.id(),
            event_name: event.name().to_string(),
            aggregate_id: event.aggregate_id(),
            payload,
            created_at: Utc::now(),
            status: OutboxStatus::Pending,
            attempts: 0,
            last_error: None,
            last_attempt_at: None,
            sent_at: None,
            locked_until: None,
        }
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    fn require(&self, from: OutboxStatus, to: OutboxStatus) -> Result<(), OutboxError> {
        if self.status == from {
            Ok(())
        } else {
            Err(OutboxError::InvalidTransition {
                id: self.id,
                from: self.status,
                to,
            })
        }
    }

    /// Pending and not leased by someone else at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == OutboxStatus::Pending && self.locked_until.is_none_or(|until| until <= now)
    }

    pub fn claim(&mut self, now: DateTime<Utc>, lease: Duration) {
        let lease = chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX);
        self.locked_until = Some(now.checked_add_signed(lease).unwrap_or(DateTime::<Utc>::MAX_UTC));
    }

    pub fn mark_sent(&mut self, now: DateTime<Utc>) -> Result<(), OutboxError> {
        self.require(OutboxStatus::Pending, OutboxStatus::Sent)?;
        self.status = OutboxStatus::Sent;
        self.sent_at = Some(now);
        self.locked_until = None;
        Ok(())
    }

    /// Record a failed delivery. The row stays pending.
    pub fn mark_failed(&mut self, error: &str, now: DateTime<Utc>) -> Result<u32, OutboxError> {
        self.require(OutboxStatus::Pending, OutboxStatus::Pending)?;
        self.attempts = self.attempts.saturating_add(1);
        self.last_error = Some(error.to_string());
        self.last_attempt_at = Some(now);
        self.locked_until = None;
        Ok(self.attempts)
    }

    pub fn dead_letter(&mut self) -> Result<(), OutboxError> {
        self.require(OutboxStatus::Pending, OutboxStatus::Failed)?;
        self.status = OutboxStatus::Failed;
        self.locked_until = None;
        Ok(())
    }

    pub fn requeue(&mut self) -> Result<(), OutboxError> {
        self.require(OutboxStatus::Failed, OutboxStatus::Pending)?;
        self.status = OutboxStatus::Pending;
        self.attempts = 0;
        Ok(())
    }
}

/// Storage of outbox rows.
///
/// `insert_tx` must run on the same transaction as the aggregate write; every
/// other operation is its own short statement outside any unit of work.
#[async_trait]
pub trait OutboxRepository: Send + Sync + 'static {
    type Tx: Send + 'static;

    async fn insert_tx(
        &self,
        ctx: &RequestContext,
        tx: &TxHandle<Self::Tx>,
        event: OutboxEvent,
    ) -> Result<(), OutboxError>;

    /// Pending rows, oldest `created_at` first.
    async fn fetch_pending(&self, ctx: &RequestContext, limit: usize) -> Result<Vec<OutboxEvent>, OutboxError>;

    /// Pending rows not leased by anyone, oldest first, leased for `lease`.
    async fn claim_pending(
        &self,
        ctx: &RequestContext,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxEvent>, OutboxError>;

    async fn mark_sent(&self, ctx: &RequestContext, id: Uuid) -> Result<(), OutboxError>;

    /// Returns the row's attempt count after the increment.
    async fn mark_failed(&self, ctx: &RequestContext, id: Uuid, error: &str) -> Result<u32, OutboxError>;

    async fn dead_letter(&self, ctx: &RequestContext, id: Uuid) -> Result<(), OutboxError>;

    /// Dead-lettered rows, oldest first.
    async fn fetch_failed(&self, ctx: &RequestContext, limit: usize) -> Result<Vec<OutboxEvent>, OutboxError>;

    async fn requeue(&self, ctx: &RequestContext, id: Uuid) -> Result<(), OutboxError>;

    async fn get(&self, ctx: &RequestContext, id: Uuid) -> Result<Option<OutboxEvent>, OutboxError>;
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn row() -> OutboxEvent {
        let event = DomainEvent::new("user.created", AggregateId::new(), Vec::new());
        OutboxEvent::pending(&event, b"{}".to_vec())
    }

    #[test]
    fn sent_is_terminal() {
        let mut row = row();
        row.mark_sent(Utc::now()).unwrap();

        assert!(matches!(row.mark_sent(Utc::now()), Err(OutboxError::InvalidTransition { .. })));
        assert!(row.mark_failed("x", Utc::now()).is_err());
        assert!(row.dead_letter().is_err());
        assert!(row.requeue().is_err());
        assert_eq!(row.status, OutboxStatus::Sent);
    }

    #[test]
    fn failures_keep_row_pending_until_dead_lettered() {
        let mut row = row();
        assert_eq!(row.mark_failed("timeout", Utc::now()).unwrap(), 1);
        assert_eq!(row.mark_failed("refused", Utc::now()).unwrap(), 2);
        assert_eq!(row.status, OutboxStatus::Pending);
        assert_eq!(row.last_error.as_deref(), Some("refused"));

        row.dead_letter().unwrap();
        assert_eq!(row.status, OutboxStatus::Failed);
        assert!(row.mark_sent(Utc::now()).is_err());

        row.requeue().unwrap();
        assert_eq!(row.status, OutboxStatus::Pending);
        assert_eq!(row.attempts, 0);
    }

    #[test]
    fn leases_expire() {
        let mut row = row();
        let now = Utc::now();
        assert!(row.is_claimable(now));

        row.claim(now, Duration::from_secs(30));
        assert!(!row.is_claimable(now));
        assert!(row.is_claimable(now + chrono::Duration::seconds(31)));

        row.mark_failed("x", now).unwrap();
        assert!(row.is_claimable(now));
    }

    #[test]
    fn status_text_round_trips() {
        for status in [OutboxStatus::Pending, OutboxStatus::Sent, OutboxStatus::Failed] {
            assert_eq!(status.as_str().parse::<OutboxStatus>(), Ok(status));
        }
        assert!("archived".parse::<OutboxStatus>().is_err());
    }

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Sent,
        Failed,
        DeadLetter,
        Requeue,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Sent),
            Just(Op::Failed),
            Just(Op::DeadLetter),
            Just(Op::Requeue),
        ]
    }

    proptest! {
        /// Whatever is attempted, a row only moves pending → sent,
        /// pending → failed → pending, and never leaves `sent`.
        #[test]
        fn status_only_moves_along_allowed_edges(ops in proptest::collection::vec(op(), 0..32)) {
            let mut row = row();
            let mut failures_since_requeue = 0u32;

            for op in ops {
                let before = row.status;
                let result = match op {
                    Op::Sent => row.mark_sent(Utc::now()),
                    Op::Failed => row.mark_failed("x", Utc::now()).map(|_| ()),
                    Op::DeadLetter => row.dead_letter(),
                    Op::Requeue => row.requeue(),
                };

                let allowed = matches!(
                    (before, row.status),
                    (OutboxStatus::Pending, OutboxStatus::Pending | OutboxStatus::Sent | OutboxStatus::Failed)
                        | (OutboxStatus::Failed, OutboxStatus::Pending | OutboxStatus::Failed)
                        | (OutboxStatus::Sent, OutboxStatus::Sent)
                );
                prop_assert!(allowed, "{before} -> {}", row.status);
                if result.is_err() {
                    prop_assert_eq!(before, row.status);
                }

                match (op, &result) {
                    (Op::Failed, Ok(())) => failures_since_requeue += 1,
                    (Op::Requeue, Ok(())) => failures_since_requeue = 0,
                    _ => {}
                }
                prop_assert_eq!(row.attempts, failures_since_requeue);
            }
        }
    }
}
