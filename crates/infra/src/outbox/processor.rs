use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use gatekeeper_core::RequestContext;
use gatekeeper_events::{DispatchError, EventDispatcher, EventSerializer};
use gatekeeper_observability::MetricsRecorder;

use super::{OutboxError, OutboxEvent, OutboxRepository};

/// Processor configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxProcessorConfig {
    /// Upper bound on rows handled per `process` call.
    pub batch_size: usize,
    /// Failed deliveries after which a row is dead-lettered. `None` retries
    /// forever.
    pub max_attempts: Option<u32>,
    /// Lease taken on fetched rows. `None` reads pending rows without leasing,
    /// which is only safe with a single processor.
    pub lease: Option<Duration>,
}

impl Default for OutboxProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_attempts: Some(10),
            lease: Some(Duration::from_secs(30)),
        }
    }
}

impl OutboxProcessorConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts.filter(|n| *n > 0);
        self
    }

    pub fn with_lease(mut self, lease: Option<Duration>) -> Self {
        self.lease = lease.filter(|d| !d.is_zero());
        self
    }
}

/// What one `process` call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
    pub fetched: usize,
    pub sent: usize,
    /// Rows that failed and stay pending for the next pass.
    pub failed: usize,
    pub dead_lettered: usize,
}

impl ProcessReport {
    /// Every row of a full batch was sent, so more rows are probably waiting.
    pub fn is_full_and_delivered(&self, batch_size: usize) -> bool {
        self.fetched > 0 && self.fetched >= batch_size && self.sent == self.fetched
    }
}

/// Batch job that delivers pending outbox rows through the dispatcher.
///
/// One `process` call handles at most `batch_size` rows, sequentially, and
/// marks each one sent or failed. It never retries within a call: failed rows
/// are picked up again by the next call. Scheduling is left to the caller
/// (see [`OutboxWorker`](crate::workers::OutboxWorker)).
pub struct OutboxProcessor<R: OutboxRepository> {
    repository: Arc<R>,
    dispatcher: Arc<EventDispatcher>,
    serializer: Arc<dyn EventSerializer>,
    metrics: Option<Arc<dyn MetricsRecorder>>,
    config: OutboxProcessorConfig,
}

impl<R: OutboxRepository> OutboxProcessor<R> {
    pub fn new(
        repository: Arc<R>,
        dispatcher: Arc<EventDispatcher>,
        serializer: Arc<dyn EventSerializer>,
        config: OutboxProcessorConfig,
    ) -> Self {
        Self {
            repository,
            dispatcher,
            serializer,
            metrics: None,
            config,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &OutboxProcessorConfig {
        &self.config
    }

    #[tracing::instrument(
        name = "outbox.process",
        skip_all,
        fields(
            fetched = tracing::field::Empty,
            sent = tracing::field::Empty,
            failed = tracing::field::Empty,
            dead_lettered = tracing::field::Empty
        )
    )]
    pub async fn process(&self, ctx: &RequestContext) -> Result<ProcessReport, OutboxError> {
        ctx.check()?;

        let rows = match self.config.lease {
            Some(lease) => {
                self.repository
                    .claim_pending(ctx, self.config.batch_size, lease)
                    .await?
            }
            None => {
                self.repository
                    .fetch_pending(ctx, self.config.batch_size)
                    .await?
            }
        };

        let mut report = ProcessReport {
            fetched: rows.len(),
            ..ProcessReport::default()
        };

        for row in rows {
            ctx.check()?;
            match self.deliver(ctx, &row).await {
                Ok(()) => {
                    self.repository.mark_sent(ctx, row.id).await?;
                    report.sent += 1;
                    self.record(&row, "sent");
                }
                Err(DeliveryFailure::Cancelled(err)) => return Err(err.into()),
                Err(DeliveryFailure::Failed(reason)) => {
                    let attempts = self.repository.mark_failed(ctx, row.id, &reason).await?;
                    if self.config.max_attempts.is_some_and(|max| attempts >= max) {
                        self.repository.dead_letter(ctx, row.id).await?;
                        report.dead_lettered += 1;
                        self.record(&row, "dead_letter");
                        tracing::error!(
                            outbox_id = %row.id,
                            event = %row.event_name,
                            attempts,
                            error = %reason,
                            "outbox row dead-lettered"
                        );
                    } else {
                        report.failed += 1;
                        self.record(&row, "retry");
                        tracing::warn!(
                            outbox_id = %row.id,
                            event = %row.event_name,
                            attempts,
                            error = %reason,
                            "outbox delivery failed, will retry"
                        );
                    }
                }
            }
        }

        let span = tracing::Span::current();
        span.record("fetched", report.fetched);
        span.record("sent", report.sent);
        span.record("failed", report.failed);
        span.record("dead_lettered", report.dead_lettered);
        Ok(report)
    }

    async fn deliver(&self, ctx: &RequestContext, row: &OutboxEvent) -> Result<(), DeliveryFailure> {
        let event = self
            .serializer
            .deserialize(&row.payload, &row.event_name)
            .map_err(|e| DeliveryFailure::Failed(e.to_string()))?;

        match self.dispatcher.dispatch(ctx, &event).await {
            Ok(()) => Ok(()),
            Err(DispatchError::Context(err)) => Err(DeliveryFailure::Cancelled(err)),
            Err(err) => Err(DeliveryFailure::Failed(err.to_string())),
        }
    }

    fn record(&self, row: &OutboxEvent, result: &'static str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_outbox(&row.event_name, result);
        }
    }
}

enum DeliveryFailure {
    /// The caller's context ended; not the row's fault, no attempt recorded.
    Cancelled(gatekeeper_core::ContextError),
    Failed(String),
}
