use core::fmt::{Debug, Display};

use thiserror::Error;

use gatekeeper_core::ContextError;

use super::MessageKind;

/// Errors returned by [`CommandBus`](super::CommandBus) and
/// [`QueryBus`](super::QueryBus).
///
/// Bus-level variants are returned to the caller and never retried by the
/// bus. `Handler` carries the handler's own error unchanged.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("no handler registered for {kind} `{name}`")]
    HandlerNotFound { kind: MessageKind, name: &'static str },

    #[error("a handler is already registered for {kind} `{name}`")]
    HandlerAlreadyRegistered { kind: MessageKind, name: &'static str },

    #[error("command `{name}` is empty")]
    NilCommand { name: &'static str },

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("{kind} `{name}` panicked: {message}")]
    Panicked {
        kind: MessageKind,
        name: &'static str,
        message: String,
    },

    /// The registry held a value of an unexpected type; indicates a bug in a
    /// middleware that replaced the payload or output.
    #[error("type mismatch while executing `{name}`")]
    TypeMismatch { name: &'static str },

    #[error(transparent)]
    Handler(anyhow::Error),
}

impl BusError {
    /// The handler's own error, if this is a `Handler` failure of type `E`.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: Display + Debug + Send + Sync + 'static,
    {
        match self {
            BusError::Handler(err) => err.downcast_ref::<E>(),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BusError::HandlerNotFound { .. })
    }
}
