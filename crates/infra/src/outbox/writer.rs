use std::sync::Arc;

use gatekeeper_core::{DomainEvent, RequestContext};
use gatekeeper_events::EventSerializer;

use super::{OutboxError, OutboxEvent, OutboxRepository};
use crate::uow::TxHandle;

/// Stages an aggregate's events in the outbox on the unit of work's
/// transaction.
///
/// Serialization failures abort with an error, which rolls back the
/// surrounding unit of work together with the aggregate write.
pub struct OutboxWriter<R: OutboxRepository> {
    repository: Arc<R>,
    serializer: Arc<dyn EventSerializer>,
}

impl<R: OutboxRepository> Clone for OutboxWriter<R> {
    fn clone(&self) -> Self {
        Self {
            repository: Arc::clone(&self.repository),
            serializer: Arc::clone(&self.serializer),
        }
    }
}

impl<R: OutboxRepository> OutboxWriter<R> {
    pub fn new(repository: Arc<R>, serializer: Arc<dyn EventSerializer>) -> Self {
        Self {
            repository,
            serializer,
        }
    }

    /// Insert one pending row per event, in order. Returns the number staged.
    pub async fn write(
        &self,
        ctx: &RequestContext,
        tx: &TxHandle<R::Tx>,
        events: &[DomainEvent],
    ) -> Result<usize, OutboxError> {
        for event in events {
            let payload = self.serializer.serialize(event)?;
            let row = OutboxEvent::pending(event, payload);
            tracing::debug!(
                event = event.name(),
                event_id = %event.id(),
                outbox_id = %row.id,
                "staging event in outbox"
            );
            self.repository.insert_tx(ctx, tx, row).await?;
        }
        Ok(events.len())
    }
}
