//! Request-scoped context threaded through every bus, database and dispatch call.
//!
//! The context carries a correlation id, an optional deadline and a cancellation
//! flag shared by all clones. Nothing in the core imposes a timeout on its own;
//! callers that want one set a deadline here.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::error::ContextError;

#[derive(Debug, Clone)]
pub struct RequestContext {
    correlation_id: Uuid,
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
    metadata: BTreeMap<String, String>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            correlation_id: Uuid::now_v7(),
            deadline: None,
            cancelled: Arc::new(AtomicBool::new(false)),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Cancel this context and every clone derived from it.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Fail fast when the caller has cancelled or the deadline has passed.
    pub fn check(&self) -> Result<(), ContextError> {
        if self.is_cancelled() {
            return Err(ContextError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(ContextError::DeadlineExceeded),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_context_is_active() {
        assert!(RequestContext::new().check().is_ok());
    }

    #[test]
    fn cancellation_is_shared_between_clones() {
        let ctx = RequestContext::new();
        let child = ctx.clone().with_metadata("user_agent", "test");
        ctx.cancel();
        assert_eq!(child.check(), Err(ContextError::Cancelled));
        assert_eq!(child.metadata().get("user_agent").map(String::as_str), Some("test"));
    }

    #[test]
    fn elapsed_deadline_is_reported() {
        let ctx = RequestContext::new().with_deadline(Instant::now() - Duration::from_millis(1));
        assert_eq!(ctx.check(), Err(ContextError::DeadlineExceeded));
    }
}
