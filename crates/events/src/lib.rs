//! Command/query dispatch and domain event delivery.
//!
//! - [`CommandBus`] / [`QueryBus`]: one handler per message type, resolved at
//!   call time and wrapped in an ordered middleware chain.
//! - [`EventDispatcher`]: fans a [`DomainEvent`](gatekeeper_core::DomainEvent)
//!   out to every matching [`EventHandler`].
//! - [`EventSerializer`]: the byte format events are staged in the outbox with.

pub mod bus;
pub mod command;
pub mod dispatcher;
pub mod handler;
pub mod serializer;

pub mod panic;

pub use bus::{
    BusError, CommandBus, LoggingMiddleware, Message, MessageKind, MetricsMiddleware, Middleware,
    Next, Output, QueryBus, TracingMiddleware, DEFAULT_SLOW_THRESHOLD,
};
pub use command::{Command, CommandHandler, Query, QueryHandler};
pub use dispatcher::{DispatchAllError, DispatchError, DispatchMode, EventDispatcher, HandlerFailure};
pub use handler::EventHandler;
pub use serializer::{EventSerializer, JsonEventSerializer, SerializationError};
