use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::Instrument;

use gatekeeper_core::RequestContext;
use gatekeeper_observability::{MetricsRecorder, Outcome, Tracer};

use super::registry::ErasedHandler;
use super::{BusError, Message, MessageKind, Output};

/// Threshold above which an execution is reported as slow.
pub const DEFAULT_SLOW_THRESHOLD: Duration = Duration::from_secs(1);

/// A layer around command/query execution.
///
/// Implementations call `next.run(ctx, message)` exactly once to continue the
/// chain, and may act before and after it. Returning without calling `next`
/// short-circuits the handler.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(
        &self,
        ctx: &RequestContext,
        message: Message,
        next: Next<'_>,
    ) -> Result<Output, BusError>;
}

/// The rest of the chain after the current middleware.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    endpoint: &'a dyn ErasedHandler,
}

impl<'a> Next<'a> {
    pub(crate) fn new(chain: &'a [Arc<dyn Middleware>], endpoint: &'a dyn ErasedHandler) -> Self {
        Self { chain, endpoint }
    }

    pub async fn run(self, ctx: &RequestContext, message: Message) -> Result<Output, BusError> {
        match self.chain.split_first() {
            Some((outer, rest)) => {
                outer
                    .handle(ctx, message, Next::new(rest, self.endpoint))
                    .await
            }
            None => self.endpoint.call(ctx, message).await,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Built-in middleware
// ─────────────────────────────────────────────────────────────────────────────

/// Opens one span per execution, records the failure on it and adds a
/// `slow_operation` event when the execution exceeds the slow threshold.
pub struct TracingMiddleware {
    tracer: Arc<dyn Tracer>,
    slow_threshold: Duration,
}

impl TracingMiddleware {
    pub fn new(tracer: Arc<dyn Tracer>) -> Self {
        Self {
            tracer,
            slow_threshold: DEFAULT_SLOW_THRESHOLD,
        }
    }

    pub fn with_slow_threshold(mut self, slow_threshold: Duration) -> Self {
        self.slow_threshold = slow_threshold;
        self
    }
}

#[async_trait]
impl Middleware for TracingMiddleware {
    async fn handle(
        &self,
        ctx: &RequestContext,
        message: Message,
        next: Next<'_>,
    ) -> Result<Output, BusError> {
        let mut scope = self.tracer.start_span(&message.operation());
        scope.add_attribute("message.kind", message.kind().to_string());
        scope.add_attribute("message.name", message.name().to_string());
        scope.add_attribute("correlation_id", ctx.correlation_id().to_string());

        let started = Instant::now();
        let result = next.run(ctx, message).instrument(scope.span()).await;
        if started.elapsed() > self.slow_threshold {
            scope.add_event("slow_operation");
        }
        if let Err(err) = &result {
            scope.record_error(&err.to_string());
        }
        result
    }
}

/// Records duration and outcome per message name.
pub struct MetricsMiddleware {
    recorder: Arc<dyn MetricsRecorder>,
}

impl MetricsMiddleware {
    pub fn new(recorder: Arc<dyn MetricsRecorder>) -> Self {
        Self { recorder }
    }
}

#[async_trait]
impl Middleware for MetricsMiddleware {
    async fn handle(
        &self,
        ctx: &RequestContext,
        message: Message,
        next: Next<'_>,
    ) -> Result<Output, BusError> {
        let name = message.name();
        let kind = message.kind();
        let started = Instant::now();

        let result = next.run(ctx, message).await;

        let outcome = Outcome::from_result(&result);
        let elapsed = started.elapsed();
        match kind {
            MessageKind::Command => self.recorder.record_command(name, outcome, elapsed),
            MessageKind::Query => self.recorder.record_query(name, outcome, elapsed),
        }
        result
    }
}

/// Logs start and outcome, and warns when an execution exceeds the slow
/// threshold. Never changes the result.
pub struct LoggingMiddleware {
    slow_threshold: Duration,
}

impl LoggingMiddleware {
    pub fn new(slow_threshold: Duration) -> Self {
        Self { slow_threshold }
    }

    pub fn slow_threshold(&self) -> Duration {
        self.slow_threshold
    }

    pub fn is_slow(&self, elapsed: Duration) -> bool {
        elapsed > self.slow_threshold
    }
}

impl Default for LoggingMiddleware {
    fn default() -> Self {
        Self::new(DEFAULT_SLOW_THRESHOLD)
    }
}

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn handle(
        &self,
        ctx: &RequestContext,
        message: Message,
        next: Next<'_>,
    ) -> Result<Output, BusError> {
        let name = message.name();
        let kind = message.kind();
        let correlation_id = ctx.correlation_id();
        tracing::debug!(%kind, name, %correlation_id, "executing");

        let started = Instant::now();
        let result = next.run(ctx, message).await;
        let elapsed = started.elapsed();
        let elapsed_ms = elapsed.as_millis() as u64;

        match &result {
            Ok(_) => tracing::info!(%kind, name, %correlation_id, elapsed_ms, "executed"),
            Err(err) => {
                tracing::error!(%kind, name, %correlation_id, elapsed_ms, error = %err, "execution failed")
            }
        }

        if self.is_slow(elapsed) {
            tracing::warn!(
                %kind,
                name,
                %correlation_id,
                elapsed_ms,
                threshold_ms = self.slow_threshold.as_millis() as u64,
                "slow {kind}"
            );
        }

        result
    }
}
