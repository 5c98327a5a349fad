//! Event (de)serialization for the outbox.

use thiserror::Error;

use gatekeeper_core::DomainEvent;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SerializationError {
    #[error("failed to encode event `{event_name}`: {reason}")]
    Encode { event_name: String, reason: String },

    #[error("failed to decode event `{event_name}`: {reason}")]
    Decode { event_name: String, reason: String },

    #[error("stored bytes hold event `{found}`, expected `{expected}`")]
    NameMismatch { expected: String, found: String },
}

/// Turns events into the bytes stored in an outbox row and back.
///
/// The byte format is durable: rows written by one process version are read
/// by the next, so implementations must stay backward compatible.
pub trait EventSerializer: Send + Sync {
    fn serialize(&self, event: &DomainEvent) -> Result<Vec<u8>, SerializationError>;

    /// Decode `bytes`, which the outbox row says hold an `event_name` event.
    fn deserialize(&self, bytes: &[u8], event_name: &str) -> Result<DomainEvent, SerializationError>;
}

/// JSON encoding of the whole [`DomainEvent`] envelope.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEventSerializer;

impl EventSerializer for JsonEventSerializer {
    fn serialize(&self, event: &DomainEvent) -> Result<Vec<u8>, SerializationError> {
        serde_json::to_vec(event).map_err(|e| SerializationError::Encode {
            event_name: event.name().to_string(),
            reason: e.to_string(),
        })
    }

    fn deserialize(&self, bytes: &[u8], event_name: &str) -> Result<DomainEvent, SerializationError> {
        let event: DomainEvent =
            serde_json::from_slice(bytes).map_err(|e| SerializationError::Decode {
                event_name: event_name.to_string(),
                reason: e.to_string(),
            })?;

        if event.name() != event_name {
            return Err(SerializationError::NameMismatch {
                expected: event_name.to_string(),
                found: event.name().to_string(),
            });
        }
        Ok(event)
    }
}
