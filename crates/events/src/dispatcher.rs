//! Fan-out of domain events to registered [`EventHandler`]s.
//!
//! ## Modes
//!
//! - **Sequential**: matching handlers run one after another in registration
//!   order. A failing handler does not stop the ones after it.
//! - **Concurrent**: every matching handler runs in its own tokio task; the
//!   dispatcher joins all of them before returning. No ordering between
//!   handlers. Fan-out is one task per matching handler per event.
//!
//! In both modes a panicking handler is caught at its own boundary and
//! reported as a failure like any other error.
//!
//! [`EventDispatcher::dispatch_all`] has a different contract: it walks a list
//! of events and stops at the first event whose dispatch fails.

use core::fmt;
use core::str::FromStr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use futures::FutureExt;
use thiserror::Error;
use tokio::task::JoinSet;

use gatekeeper_core::{ContextError, DomainEvent, RequestContext};
use gatekeeper_observability::{MetricsRecorder, Outcome};

use crate::handler::EventHandler;
use crate::panic::panic_message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    #[default]
    Sequential,
    Concurrent,
}

impl FromStr for DispatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" | "sync" => Ok(Self::Sequential),
            "concurrent" | "async" => Ok(Self::Concurrent),
            other => Err(format!("unknown dispatch mode `{other}`")),
        }
    }
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchMode::Sequential => f.write_str("sequential"),
            DispatchMode::Concurrent => f.write_str("concurrent"),
        }
    }
}

/// One handler that failed while handling an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    pub handler: String,
    pub error: String,
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.handler, self.error)
    }
}

fn format_failures(failures: &[HandlerFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error(transparent)]
    Context(#[from] ContextError),

    /// At least one matching handler failed; every matching handler was still
    /// attempted.
    #[error(
        "{} of {attempted} handler(s) failed for `{event_name}`: {}",
        .failures.len(),
        format_failures(.failures)
    )]
    HandlersFailed {
        event_name: String,
        attempted: usize,
        failures: Vec<HandlerFailure>,
    },
}

impl DispatchError {
    pub fn failures(&self) -> &[HandlerFailure] {
        match self {
            DispatchError::HandlersFailed { failures, .. } => failures,
            DispatchError::Context(_) => &[],
        }
    }
}

/// Returned by [`EventDispatcher::dispatch_all`]: the position of the first
/// event that failed. Events after it were not dispatched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("dispatch stopped at event {index} (`{event_name}`): {source}")]
pub struct DispatchAllError {
    pub index: usize,
    pub event_name: String,
    #[source]
    pub source: DispatchError,
}

pub struct EventDispatcher {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
    mode: DispatchMode,
    metrics: Option<Arc<dyn MetricsRecorder>>,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(DispatchMode::default())
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("mode", &self.mode)
            .field("handlers", &self.handler_count())
            .finish()
    }
}

impl EventDispatcher {
    pub fn new(mode: DispatchMode) -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            mode,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// Append a handler. Sequential dispatch runs handlers in this order.
    pub fn register_handler<H: EventHandler>(&self, handler: H) {
        self.register_shared(Arc::new(handler));
    }

    pub fn register_shared(&self, handler: Arc<dyn EventHandler>) {
        tracing::debug!(handler = handler.name(), "event handler registered");
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn matching(&self, event_name: &str) -> Vec<Arc<dyn EventHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|h| h.can_handle(event_name))
            .cloned()
            .collect()
    }

    /// Dispatch one event using the configured mode.
    pub async fn dispatch(&self, ctx: &RequestContext, event: &DomainEvent) -> Result<(), DispatchError> {
        match self.mode {
            DispatchMode::Sequential => self.dispatch_sync(ctx, event).await,
            DispatchMode::Concurrent => self.dispatch_async(ctx, event).await,
        }
    }

    /// Run every matching handler in registration order, without stopping
    /// at the first failure.
    pub async fn dispatch_sync(
        &self,
        ctx: &RequestContext,
        event: &DomainEvent,
    ) -> Result<(), DispatchError> {
        ctx.check()?;
        let handlers = self.matching(event.name());
        let started = Instant::now();

        let mut failures = Vec::new();
        for handler in &handlers {
            if let Err(error) = run_handler(handler.as_ref(), ctx, event).await {
                tracing::warn!(
                    event = event.name(),
                    event_id = %event.id(),
                    handler = handler.name(),
                    %error,
                    "event handler failed"
                );
                failures.push(HandlerFailure {
                    handler: handler.name().to_string(),
                    error,
                });
            }
        }

        self.finish(event, handlers.len(), failures, started)
    }

    /// Run every matching handler in its own task and wait for all of them.
    pub async fn dispatch_async(
        &self,
        ctx: &RequestContext,
        event: &DomainEvent,
    ) -> Result<(), DispatchError> {
        ctx.check()?;
        let handlers = self.matching(event.name());
        let started = Instant::now();
        let attempted = handlers.len();

        let shared = Arc::new(event.clone());
        let mut tasks = JoinSet::new();
        for handler in handlers {
            let ctx = ctx.clone();
            let event = Arc::clone(&shared);
            tasks.spawn(async move {
                let result = run_handler(handler.as_ref(), &ctx, &event).await;
                (handler.name().to_string(), result)
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (handler, result) = match joined {
                Ok(done) => done,
                Err(join_err) => ("<unknown>".to_string(), Err(join_err.to_string())),
            };
            if let Err(error) = result {
                tracing::warn!(
                    event = event.name(),
                    event_id = %event.id(),
                    handler = %handler,
                    %error,
                    "event handler failed"
                );
                failures.push(HandlerFailure { handler, error });
            }
        }

        self.finish(event, attempted, failures, started)
    }

    /// Dispatch `events` one at a time, stopping at the first failure.
    pub async fn dispatch_all(
        &self,
        ctx: &RequestContext,
        events: &[DomainEvent],
    ) -> Result<(), DispatchAllError> {
        for (index, event) in events.iter().enumerate() {
            self.dispatch(ctx, event)
                .await
                .map_err(|source| DispatchAllError {
                    index,
                    event_name: event.name().to_string(),
                    source,
                })?;
        }
        Ok(())
    }

    fn finish(
        &self,
        event: &DomainEvent,
        attempted: usize,
        failures: Vec<HandlerFailure>,
        started: Instant,
    ) -> Result<(), DispatchError> {
        let result = if failures.is_empty() {
            Ok(())
        } else {
            Err(DispatchError::HandlersFailed {
                event_name: event.name().to_string(),
                attempted,
                failures,
            })
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_event_dispatch(event.name(), Outcome::from_result(&result), started.elapsed());
        }
        if attempted == 0 {
            tracing::debug!(event = event.name(), "no handler matched event");
        }
        result
    }
}

/// Runs one handler behind its own panic boundary.
async fn run_handler(
    handler: &dyn EventHandler,
    ctx: &RequestContext,
    event: &DomainEvent,
) -> Result<(), String> {
    match AssertUnwindSafe(handler.handle(ctx, event)).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(format!("{err:#}")),
        Err(payload) => Err(format!("panicked: {}", panic_message(payload.as_ref()))),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use gatekeeper_core::AggregateId;
    use gatekeeper_observability::{InMemoryMetrics, MetricKind};

    use super::*;

    #[derive(Clone, Copy)]
    enum Behavior {
        Succeed,
        Fail,
        Panic,
    }

    struct Probe {
        name: &'static str,
        prefix: &'static str,
        behavior: Behavior,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Probe {
        fn new(name: &'static str, behavior: Behavior, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name,
                prefix: "user.",
                behavior,
                log: log.clone(),
            }
        }
    }

    #[async_trait]
    impl EventHandler for Probe {
        fn name(&self) -> &str {
            self.name
        }

        fn can_handle(&self, event_name: &str) -> bool {
            event_name.starts_with(self.prefix)
        }

        async fn handle(&self, _ctx: &RequestContext, event: &DomainEvent) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_millis(1)).await;
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.name, event.name()));
            match self.behavior {
                Behavior::Succeed => Ok(()),
                Behavior::Fail => anyhow::bail!("{} refused {}", self.name, event.name()),
                Behavior::Panic => panic!("{} blew up", self.name),
            }
        }
    }

    /// Fails only for one specific event name.
    struct FailOn {
        event_name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl EventHandler for FailOn {
        fn name(&self) -> &str {
            "fail_on"
        }

        fn can_handle(&self, _event_name: &str) -> bool {
            true
        }

        async fn handle(&self, _ctx: &RequestContext, event: &DomainEvent) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(event.name().to_string());
            if event.name() == self.event_name {
                anyhow::bail!("cannot handle {}", event.name());
            }
            Ok(())
        }
    }

    fn event(name: &str) -> DomainEvent {
        DomainEvent::new(name, AggregateId::new(), Vec::new())
    }

    #[tokio::test]
    async fn sync_dispatch_runs_every_matching_handler_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = EventDispatcher::new(DispatchMode::Sequential);
        dispatcher.register_handler(Probe::new("audit", Behavior::Succeed, &log));
        dispatcher.register_handler(Probe::new("mailer", Behavior::Fail, &log));
        dispatcher.register_handler(Probe::new("publisher", Behavior::Succeed, &log));

        let err = dispatcher
            .dispatch(&RequestContext::new(), &event("user.created"))
            .await
            .unwrap_err();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["audit:user.created", "mailer:user.created", "publisher:user.created"]
        );
        assert_eq!(
            err.failures(),
            &[HandlerFailure {
                handler: "mailer".to_string(),
                error: "mailer refused user.created".to_string(),
            }]
        );
        assert!(err.to_string().starts_with("1 of 3 handler(s) failed"));
    }

    #[tokio::test]
    async fn sync_dispatch_succeeds_when_all_handlers_do() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = EventDispatcher::default();
        dispatcher.register_handler(Probe::new("audit", Behavior::Succeed, &log));

        dispatcher
            .dispatch(&RequestContext::new(), &event("user.created"))
            .await
            .unwrap();
        dispatcher
            .dispatch(&RequestContext::new(), &event("billing.invoiced"))
            .await
            .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["audit:user.created"]);
    }

    #[tokio::test]
    async fn sync_dispatch_recovers_panics() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = EventDispatcher::new(DispatchMode::Sequential);
        dispatcher.register_handler(Probe::new("bomb", Behavior::Panic, &log));
        dispatcher.register_handler(Probe::new("audit", Behavior::Succeed, &log));

        let err = dispatcher
            .dispatch(&RequestContext::new(), &event("user.created"))
            .await
            .unwrap_err();

        assert_eq!(err.failures().len(), 1);
        assert_eq!(err.failures()[0].error, "panicked: bomb blew up");
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn async_dispatch_joins_all_handlers_and_survives_panics() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let metrics = Arc::new(InMemoryMetrics::new());
        let dispatcher =
            EventDispatcher::new(DispatchMode::Concurrent).with_metrics(metrics.clone());
        dispatcher.register_handler(Probe::new("audit", Behavior::Succeed, &log));
        dispatcher.register_handler(Probe::new("bomb", Behavior::Panic, &log));
        dispatcher.register_handler(Probe::new("mailer", Behavior::Fail, &log));

        let err = dispatcher
            .dispatch(&RequestContext::new(), &event("user.created"))
            .await
            .unwrap_err();

        let mut seen = log.lock().unwrap().clone();
        seen.sort();
        assert_eq!(
            seen,
            vec!["audit:user.created", "bomb:user.created", "mailer:user.created"]
        );

        let mut failed: Vec<_> = err.failures().iter().map(|f| f.handler.clone()).collect();
        failed.sort();
        assert_eq!(failed, vec!["bomb", "mailer"]);
        assert_eq!(metrics.count(MetricKind::EventDispatch, "user.created", "failure"), 1);
    }

    #[tokio::test]
    async fn dispatch_all_stops_at_first_failing_event() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = EventDispatcher::new(DispatchMode::Sequential);
        dispatcher.register_handler(FailOn {
            event_name: "e2",
            log: log.clone(),
        });

        let events = [event("e1"), event("e2"), event("e3")];
        let err = dispatcher
            .dispatch_all(&RequestContext::new(), &events)
            .await
            .unwrap_err();

        assert_eq!(err.index, 1);
        assert_eq!(err.event_name, "e2");
        assert_eq!(*log.lock().unwrap(), vec!["e1", "e2"]);
    }

    #[tokio::test]
    async fn cancelled_context_dispatches_nothing() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = EventDispatcher::default();
        dispatcher.register_handler(Probe::new("audit", Behavior::Succeed, &log));

        let ctx = RequestContext::new();
        ctx.cancel();
        let err = dispatcher
            .dispatch(&ctx, &event("user.created"))
            .await
            .unwrap_err();

        assert_eq!(err, DispatchError::Context(ContextError::Cancelled));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn parses_dispatch_modes() {
        assert_eq!("sequential".parse::<DispatchMode>(), Ok(DispatchMode::Sequential));
        assert_eq!("Concurrent".parse::<DispatchMode>(), Ok(DispatchMode::Concurrent));
        assert!("parallel".parse::<DispatchMode>().is_err());
    }
}
