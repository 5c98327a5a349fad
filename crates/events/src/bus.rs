//! Command and query buses.
//!
//! Both buses share one type-erased registry: handlers are registered with
//! their concrete message type, stored behind an adapter keyed by `TypeId`,
//! and resolved again by type at `execute` time.
//!
//! ## Execution pipeline
//!
//! ```text
//! execute(ctx, msg)
//!   -> reject nil / cancelled
//!   -> snapshot (handler, middleware) under a read lock, release it
//!   -> middleware[0] -> middleware[1] -> ... -> handler
//!   <- ...            <- middleware[1] <- middleware[0]
//!   -> downcast output back to the message's `Output`
//! ```
//!
//! Middleware registered first is the outermost layer. Panics anywhere in the
//! chain are caught at the bus and returned as `BusError::Panicked`.

use core::any::Any;
use core::fmt;

mod command_bus;
mod error;
mod middleware;
mod query_bus;
mod registry;

pub use command_bus::CommandBus;
pub use error::BusError;
pub use middleware::{
    DEFAULT_SLOW_THRESHOLD, LoggingMiddleware, MetricsMiddleware, Middleware, Next,
    TracingMiddleware,
};
pub use query_bus::QueryBus;

/// Type-erased handler result travelling back through the middleware chain.
pub type Output = Box<dyn Any + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Command,
    Query,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Command => "command",
            MessageKind::Query => "query",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command or query on its way through the middleware chain.
///
/// Middleware sees the name and kind; the payload can be inspected with
/// [`Message::downcast_ref`] when a middleware knows the concrete type.
pub struct Message {
    name: &'static str,
    kind: MessageKind,
    payload: Box<dyn Any + Send>,
}

impl Message {
    pub(crate) fn new(name: &'static str, kind: MessageKind, payload: Box<dyn Any + Send>) -> Self {
        Self {
            name,
            kind,
            payload,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Operation label used for spans and logs, e.g. `command.register_user`.
    pub fn operation(&self) -> String {
        format!("{}.{}", self.kind, self.name)
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    pub(crate) fn into_payload(self) -> Box<dyn Any + Send> {
        self.payload
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}
