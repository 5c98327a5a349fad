use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use gatekeeper_core::RequestContext;

use crate::outbox::{OutboxProcessor, OutboxRepository};

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    ///
    /// A `process` pass already running is finished first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.join.await {
            warn!(error = %err, "outbox worker task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Drives an [`OutboxProcessor`] on a fixed interval.
///
/// - Sleeps `poll_interval` between passes
/// - Re-polls immediately after a full batch that was delivered completely,
///   so a backlog drains without waiting out the interval. A batch with any
///   failure waits, which keeps retries on the next pass
/// - Logs and keeps going when a pass fails
#[derive(Debug)]
pub struct OutboxWorker;

impl OutboxWorker {
    /// Spawn the worker on the current tokio runtime.
    pub fn spawn<R: OutboxRepository>(
        name: &'static str,
        processor: Arc<OutboxProcessor<R>>,
        poll_interval: Duration,
    ) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(worker_loop(name, processor, poll_interval, shutdown_rx));

        WorkerHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}

async fn worker_loop<R: OutboxRepository>(
    name: &'static str,
    processor: Arc<OutboxProcessor<R>>,
    poll_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(worker = name, interval_ms = poll_interval.as_millis() as u64, "outbox worker started");
    let batch_size = processor.config().batch_size;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let ctx = RequestContext::new();
        match processor.process(&ctx).await {
            Ok(report) if report.is_full_and_delivered(batch_size) => continue,
            Ok(_) => {}
            Err(err) => error!(worker = name, error = %err, "outbox pass failed"),
        }

        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    info!(worker = name, "outbox worker stopped");
}
