//! `gatekeeper-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the domain event value, the aggregate event buffer and the
//! request context threaded through every call.

pub mod aggregate;
pub mod context;
pub mod error;
pub mod event;
pub mod id;
pub mod value_object;

pub use aggregate::{AggregateRoot, EventBuffer, ExpectedVersion};
pub use context::RequestContext;
pub use error::{ContextError, DomainError, DomainResult};
pub use event::DomainEvent;
pub use id::{AggregateId, EventId};
pub use value_object::ValueObject;

#[doc(hidden)]
pub mod __private {
    pub use serde::{Deserialize, Serialize};
    pub use uuid::Uuid;
}
