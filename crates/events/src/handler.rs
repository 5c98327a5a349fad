use async_trait::async_trait;

use gatekeeper_core::{DomainEvent, RequestContext};

/// A consumer of domain events (audit log, broker publisher, projection, ...).
///
/// Delivery is at-least-once: the outbox re-dispatches an event until every
/// matching handler succeeds in the same pass, so a handler may see an event
/// it already processed. Handlers must be idempotent.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Name used in logs and failure reports.
    fn name(&self) -> &str;

    fn can_handle(&self, event_name: &str) -> bool;

    async fn handle(&self, ctx: &RequestContext, event: &DomainEvent) -> anyhow::Result<()>;
}
