//! Aggregate root trait and the pending-event buffer aggregates own.

use crate::error::{DomainError, DomainResult};
use crate::event::DomainEvent;

/// Aggregate root marker + minimal interface.
///
/// An aggregate owns an ordered, append-only buffer of events recorded by its
/// domain methods. The service that persists the aggregate stages the pending
/// events in the outbox within the same unit of work and drains the buffer
/// once that unit of work has committed.
pub trait AggregateRoot {
    /// Strongly-typed aggregate identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the aggregate identifier.
    fn id(&self) -> &Self::Id;

    /// Monotonically increasing version of the aggregate's state.
    ///
    /// Incremented once per recorded event, including events still pending.
    fn version(&self) -> u64;

    /// Events recorded since the aggregate was loaded or last drained.
    fn pending_events(&self) -> &[DomainEvent];

    /// Read and clear the pending events.
    fn take_events(&mut self) -> Vec<DomainEvent>;

    /// Version the storage layer last saw (before the pending events).
    fn persisted_version(&self) -> u64 {
        self.version()
            .saturating_sub(self.pending_events().len() as u64)
    }
}

/// Ordered, append-only list of events waiting to be staged in the outbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventBuffer {
    pending: Vec<DomainEvent>,
}

impl EventBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, event: DomainEvent) {
        self.pending.push(event);
    }

    pub fn pending(&self) -> &[DomainEvent] {
        &self.pending
    }

    /// Hand out every pending event and leave the buffer empty.
    pub fn drain(&mut self) -> Vec<DomainEvent> {
        std::mem::take(&mut self.pending)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Optimistic concurrency expectation for an aggregate.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip version checking (useful for idempotent commands, migrations, etc.).
    Any,
    /// Require the aggregate to be at an exact version.
    Exact(u64),
}

impl ExpectedVersion {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }

    pub fn check(self, actual: u64) -> DomainResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "optimistic concurrency check failed (expected: {self:?}, actual: {actual})"
            )))
        }
    }
}
