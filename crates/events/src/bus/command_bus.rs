use core::any::TypeId;
use std::sync::Arc;
use std::time::Duration;

use gatekeeper_core::RequestContext;
use gatekeeper_observability::{MetricsRecorder, Tracer};

use super::registry::{CommandAdapter, Registry};
use super::{
    BusError, LoggingMiddleware, MessageKind, MetricsMiddleware, Middleware, TracingMiddleware,
};
use crate::command::{Command, CommandHandler};

/// Routes each command type to its single registered handler.
///
/// Cloning is cheap; clones share the same registry. Register handlers and
/// middleware at startup, then share the bus across request tasks.
#[derive(Clone)]
pub struct CommandBus {
    registry: Arc<Registry>,
}

impl Default for CommandBus {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandBus {
    /// A bus with no middleware.
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry::new(MessageKind::Command)),
        }
    }

    /// A bus with the tracing, metrics and logging middleware installed, in
    /// that order (tracing outermost).
    pub fn with_observability(
        tracer: Arc<dyn Tracer>,
        metrics: Arc<dyn MetricsRecorder>,
        slow_threshold: Duration,
    ) -> Self {
        let bus = Self::new();
        bus.use_middleware(TracingMiddleware::new(tracer).with_slow_threshold(slow_threshold));
        bus.use_middleware(MetricsMiddleware::new(metrics));
        bus.use_middleware(LoggingMiddleware::new(slow_threshold));
        bus
    }

    /// Register the handler for `C`.
    ///
    /// Fails with `HandlerAlreadyRegistered` if `C` already has a handler; the
    /// existing handler stays in place.
    pub fn register<C, H>(&self, handler: H) -> Result<(), BusError>
    where
        C: Command,
        H: CommandHandler<C>,
    {
        self.registry.register(
            TypeId::of::<C>(),
            C::NAME,
            Arc::new(CommandAdapter::<C, H>::new(handler)),
        )?;
        tracing::debug!(command = C::NAME, "command handler registered");
        Ok(())
    }

    /// Append a middleware. The first one added is the outermost layer.
    pub fn use_middleware<M: Middleware + 'static>(&self, middleware: M) {
        self.registry.push_middleware(Arc::new(middleware));
    }

    pub fn is_registered<C: Command>(&self) -> bool {
        self.registry.contains(TypeId::of::<C>())
    }

    pub fn middleware_count(&self) -> usize {
        self.registry.middleware_len()
    }

    /// Execute `command` through the middleware chain and return the
    /// handler's output.
    pub async fn execute<C: Command>(
        &self,
        ctx: &RequestContext,
        command: C,
    ) -> Result<C::Output, BusError> {
        if command.is_nil() {
            return Err(BusError::NilCommand { name: C::NAME });
        }
        ctx.check()?;

        let output = self
            .registry
            .dispatch(ctx, TypeId::of::<C>(), C::NAME, Box::new(command))
            .await?;

        output
            .downcast::<C::Output>()
            .map(|output| *output)
            .map_err(|_| BusError::TypeMismatch { name: C::NAME })
    }
}
