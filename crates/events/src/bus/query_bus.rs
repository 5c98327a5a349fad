use core::any::TypeId;
use std::sync::Arc;
use std::time::Duration;

use gatekeeper_core::RequestContext;
use gatekeeper_observability::{MetricsRecorder, Tracer};

use super::registry::{QueryAdapter, Registry};
use super::{
    BusError, LoggingMiddleware, MessageKind, MetricsMiddleware, Middleware, TracingMiddleware,
};
use crate::command::{Query, QueryHandler};

/// Read-side twin of [`CommandBus`](super::CommandBus): same registration,
/// lookup and middleware rules, handlers return a typed result.
#[derive(Clone)]
pub struct QueryBus {
    registry: Arc<Registry>,
}

impl Default for QueryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryBus {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry::new(MessageKind::Query)),
        }
    }

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

    pub fn register<Q, H>(&self, handler: H) -> Result<(), BusError>
    where
        Q: Query,
        H: QueryHandler<Q>,
    {
        self.registry.register(
            TypeId::of::<Q>(),
            Q::NAME,
            Arc::new(QueryAdapter::<Q, H>::new(handler)),
        )?;
        tracing::debug!(query = Q::NAME, "query handler registered");
        Ok(())
    }

    pub fn use_middleware<M: Middleware + 'static>(&self, middleware: M) {
        self.registry.push_middleware(Arc::new(middleware));
    }

    pub fn is_registered<Q: Query>(&self) -> bool {
        self.registry.contains(TypeId::of::<Q>())
    }

    pub async fn execute<Q: Query>(&self, ctx: &RequestContext, query: Q) -> Result<Q::Output, BusError> {
        ctx.check()?;

        let output = self
            .registry
            .dispatch(ctx, TypeId::of::<Q>(), Q::NAME, Box::new(query))
            .await?;

        output
            .downcast::<Q::Output>()
            .map(|output| *output)
            .map_err(|_| BusError::TypeMismatch { name: Q::NAME })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use gatekeeper_observability::{InMemoryMetrics, MetricKind, NoopTracer};

    use super::*;

    struct LookupName {
        id: u32,
    }

    impl Query for LookupName {
        type Output = Option<String>;
        const NAME: &'static str = "lookup_name";
    }

    struct Directory(HashMap<u32, String>);

    #[async_trait]
    impl QueryHandler<LookupName> for Directory {
        async fn handle(&self, _ctx: &RequestContext, query: LookupName) -> anyhow::Result<Option<String>> {
            Ok(self.0.get(&query.id).cloned())
        }
    }

    fn directory() -> Directory {
        Directory(HashMap::from([(1, "ada".to_string())]))
    }

    #[tokio::test]
    async fn returns_typed_result() {
        let bus = QueryBus::new();
        bus.register::<LookupName, _>(directory()).unwrap();
        assert!(bus.is_registered::<LookupName>());

        let ctx = RequestContext::new();
        assert_eq!(
            bus.execute(&ctx, LookupName { id: 1 }).await.unwrap(),
            Some("ada".to_string())
        );
        assert_eq!(bus.execute(&ctx, LookupName { id: 2 }).await.unwrap(), None);
    }

    #[tokio::test]
    async fn duplicate_and_missing_handlers_are_rejected() {
        let bus = QueryBus::new();
        let err = bus
            .execute(&RequestContext::new(), LookupName { id: 1 })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BusError::HandlerNotFound {
                kind: MessageKind::Query,
                name: "lookup_name"
            }
        ));

        bus.register::<LookupName, _>(directory()).unwrap();
        assert!(matches!(
            bus.register::<LookupName, _>(directory()),
            Err(BusError::HandlerAlreadyRegistered { .. })
        ));
    }

    #[tokio::test]
    async fn records_query_metrics() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let bus = QueryBus::with_observability(
            Arc::new(NoopTracer),
            metrics.clone(),
            Duration::from_secs(1),
        );
        bus.register::<LookupName, _>(directory()).unwrap();

        bus.execute(&RequestContext::new(), LookupName { id: 1 })
            .await
            .unwrap();

        assert_eq!(metrics.count(MetricKind::Query, "lookup_name", "success"), 1);
        assert_eq!(metrics.count(MetricKind::Command, "lookup_name", "success"), 0);
    }
}
