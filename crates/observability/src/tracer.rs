/// Starts spans around units of work (bus executions, dispatches).
pub trait Tracer: Send + Sync {
    fn start_span(&self, operation: &str) -> Box<dyn SpanScope>;
}

/// An open span. Dropping it ends the span.
pub trait SpanScope: Send {
    fn add_attribute(&mut self, key: &str, value: String);

    fn add_event(&mut self, name: &str);

    fn record_error(&mut self, error: &str);

    /// The `tracing` span futures should be instrumented with, if any.
    fn span(&self) -> ::tracing::Span {
        ::tracing::Span::none()
    }
}

/// Tracer backed by `tracing` spans.
///
/// Attributes and events become events inside the span so any subscriber
/// (fmt, OpenTelemetry bridge, ...) sees them with the span's context.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTracer;

impl Tracer for TracingTracer {
    fn start_span(&self, operation: &str) -> Box<dyn SpanScope> {
        let span = ::tracing::info_span!(
            "gatekeeper.operation",
            operation = %operation,
            error = ::tracing::field::Empty
        );
        Box::new(TracingSpan { span })
    }
}

struct TracingSpan {
    span: ::tracing::Span,
}

impl SpanScope for TracingSpan {
    fn add_attribute(&mut self, key: &str, value: String) {
        ::tracing::debug!(parent: &self.span, attribute = key, value = %value, "span attribute");
    }

    fn add_event(&mut self, name: &str) {
        ::tracing::info!(parent: &self.span, event = name, "span event");
    }

    fn record_error(&mut self, error: &str) {
        self.span.record("error", error);
    }

    fn span(&self) -> ::tracing::Span {
        self.span.clone()
    }
}

/// Tracer that records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl Tracer for NoopTracer {
    fn start_span(&self, _operation: &str) -> Box<dyn SpanScope> {
        Box::new(NoopSpan)
    }
}

struct NoopSpan;

impl SpanScope for NoopSpan {
    fn add_attribute(&mut self, _key: &str, _value: String) {}

    fn add_event(&mut self, _name: &str) {}

    fn record_error(&mut self, _error: &str) {}
}
