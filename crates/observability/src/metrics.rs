use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;

/// Success/failure label attached to every recorded operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn from_result<T, E>(result: &Result<T, E>) -> Self {
        if result.is_ok() {
            Self::Success
        } else {
            Self::Failure
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        }
    }
}

/// Receives timing and outcome of the operations the core executes.
///
/// Implementations must be cheap and non-blocking: they are called inline on
/// every command, query, dispatched event and outbox row.
pub trait MetricsRecorder: Send + Sync {
    fn record_command(&self, name: &str, outcome: Outcome, duration: Duration);

    fn record_query(&self, name: &str, outcome: Outcome, duration: Duration);

    fn record_event_dispatch(&self, event_name: &str, outcome: Outcome, duration: Duration);

    /// One outbox row finished processing (`sent`, `retry` or `dead_letter`).
    fn record_outbox(&self, event_name: &str, result: &'static str);
}

/// Recorder backed by the `metrics` facade.
///
/// Whatever exporter the process installs (Prometheus, statsd, ...) receives
/// the samples; with no exporter installed the calls are no-ops.
#[derive(Debug, Clone, Copy, Default)]
pub struct FacadeMetricsRecorder;

impl MetricsRecorder for FacadeMetricsRecorder {
    fn record_command(&self, name: &str, outcome: Outcome, duration: Duration) {
        ::metrics::counter!(
            "gatekeeper_commands_total",
            "command" => name.to_string(),
            "status" => outcome.as_str()
        )
        .increment(1);
        ::metrics::histogram!("gatekeeper_command_duration_seconds", "command" => name.to_string())
            .record(duration.as_secs_f64());
    }

    fn record_query(&self, name: &str, outcome: Outcome, duration: Duration) {
        ::metrics::counter!(
            "gatekeeper_queries_total",
            "query" => name.to_string(),
            "status" => outcome.as_str()
        )
        .increment(1);
        ::metrics::histogram!("gatekeeper_query_duration_seconds", "query" => name.to_string())
            .record(duration.as_secs_f64());
    }

    fn record_event_dispatch(&self, event_name: &str, outcome: Outcome, duration: Duration) {
        ::metrics::counter!(
            "gatekeeper_event_dispatch_total",
            "event" => event_name.to_string(),
            "status" => outcome.as_str()
        )
        .increment(1);
        ::metrics::histogram!(
            "gatekeeper_event_dispatch_duration_seconds",
            "event" => event_name.to_string()
        )
        .record(duration.as_secs_f64());
    }

    fn record_outbox(&self, event_name: &str, result: &'static str) {
        ::metrics::counter!(
            "gatekeeper_outbox_rows_total",
            "event" => event_name.to_string(),
            "result" => result
        )
        .increment(1);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Command,
    Query,
    EventDispatch,
    Outbox,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSample {
    pub kind: MetricKind,
    pub name: String,
    /// `success`/`failure` for timed operations, the row result for outbox samples.
    pub label: String,
    pub duration: Option<Duration>,
}

/// Recorder that keeps every sample in memory (tests, local runs).
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    samples: Mutex<Vec<MetricSample>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples(&self) -> Vec<MetricSample> {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of samples of `kind` recorded for `name` with `label`.
    pub fn count(&self, kind: MetricKind, name: &str, label: &str) -> usize {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.kind == kind && s.name == name && s.label == label)
            .count()
    }

    fn push(&self, kind: MetricKind, name: &str, label: &str, duration: Option<Duration>) {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(MetricSample {
                kind,
                name: name.to_string(),
                label: label.to_string(),
                duration,
            });
    }
}

impl MetricsRecorder for InMemoryMetrics {
    fn record_command(&self, name: &str, outcome: Outcome, duration: Duration) {
        self.push(MetricKind::Command, name, outcome.as_str(), Some(duration));
    }

    fn record_query(&self, name: &str, outcome: Outcome, duration: Duration) {
        self.push(MetricKind::Query, name, outcome.as_str(), Some(duration));
    }

    fn record_event_dispatch(&self, event_name: &str, outcome: Outcome, duration: Duration) {
        self.push(MetricKind::EventDispatch, event_name, outcome.as_str(), Some(duration));
    }

    fn record_outbox(&self, event_name: &str, result: &'static str) {
        self.push(MetricKind::Outbox, event_name, result, None);
    }
}
