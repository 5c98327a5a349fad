use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{AggregateId, EventId};

/// A fact recorded by an aggregate.
///
/// Events are:
/// - **immutable** (fields are only readable once constructed)
/// - produced by aggregate methods, never by infrastructure
/// - carried with an opaque byte payload so transports never need the
///   concrete payload type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainEvent {
    id: EventId,
    name: String,
    occurred_at: DateTime<Utc>,
    aggregate_id: AggregateId,
    payload: Vec<u8>,
    metadata: BTreeMap<String, String>,
}

impl DomainEvent {
    pub fn new(name: impl Into<String>, aggregate_id: AggregateId, payload: Vec<u8>) -> Self {
        Self {
            id: EventId::new(),
            name: name.into(),
            occurred_at: Utc::now(),
            aggregate_id,
            payload,
            metadata: BTreeMap::new(),
        }
    }

    /// Build an event whose payload is the JSON encoding of `payload`.
    pub fn from_payload<P>(
        name: impl Into<String>,
        aggregate_id: AggregateId,
        payload: &P,
    ) -> DomainResult<Self>
    where
        P: Serialize,
    {
        let bytes = serde_json::to_vec(payload)
            .map_err(|e| DomainError::payload(format!("payload encoding failed: {e}")))?;
        Ok(Self::new(name, aggregate_id, bytes))
    }

    pub fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    /// Stable event name (e.g. "user.created").
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Decode a JSON payload produced by [`DomainEvent::from_payload`].
    pub fn decode_payload<P>(&self) -> DomainResult<P>
    where
        P: DeserializeOwned,
    {
        serde_json::from_slice(&self.payload).map_err(|e| {
            DomainError::payload(format!("payload decoding failed for `{}`: {e}", self.name))
        })
    }
}
