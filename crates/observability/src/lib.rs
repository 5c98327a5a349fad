//! Tracing, logging, metrics (shared setup and the seams the core reports through).

/// Initialize process-wide observability (tracing/logging) with JSON output.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    self::tracing::init(LogFormat::Json);
}

/// Tracing configuration (filters, layers).
pub mod tracing;

/// Span seam used by the bus middleware.
pub mod tracer;

/// Metrics seam and exporters.
pub mod metrics;

pub use self::metrics::{
    FacadeMetricsRecorder, InMemoryMetrics, MetricKind, MetricSample, MetricsRecorder, Outcome,
};
pub use tracer::{NoopTracer, SpanScope, Tracer, TracingTracer};
pub use self::tracing::{LogFormat, ParseLogFormatError};
