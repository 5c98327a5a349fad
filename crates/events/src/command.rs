use async_trait::async_trait;

use gatekeeper_core::RequestContext;

/// A request to change state, routed to exactly one [`CommandHandler`].
///
/// The associated `Output` is what the handler hands back to the caller
/// through the bus (e.g. the id of a registered user, a login result). Results
/// always travel through the return path, never through the context.
///
/// Commands must be `Send + 'static`: the bus moves them through a type-erased
/// middleware chain that may cross task boundaries.
pub trait Command: Send + Sync + 'static {
    type Output: Send + 'static;

    /// Stable name used for logs, spans and metrics (e.g. "register_user").
    const NAME: &'static str;

    /// A command with no meaningful content (the zero value) is rejected by the
    /// bus with `BusError::NilCommand` before any handler runs.
    fn is_nil(&self) -> bool {
        false
    }
}

/// A request to read state, routed to exactly one [`QueryHandler`].
pub trait Query: Send + Sync + 'static {
    type Output: Send + 'static;

    const NAME: &'static str;
}

/// Handles one command type.
///
/// Errors are returned as `anyhow::Error` so each handler keeps its own error
/// type; callers recover it with `BusError::downcast_ref`.
#[async_trait]
pub trait CommandHandler<C: Command>: Send + Sync + 'static {
    async fn handle(&self, ctx: &RequestContext, command: C) -> anyhow::Result<C::Output>;
}

/// Handles one query type. Query handlers must not change state.
#[async_trait]
pub trait QueryHandler<Q: Query>: Send + Sync + 'static {
    async fn handle(&self, ctx: &RequestContext, query: Q) -> anyhow::Result<Q::Output>;
}
