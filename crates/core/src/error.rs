//! Errors raised by domain code and by the request context.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// A deterministic failure of a domain rule.
///
/// Storage and transport failures are not represented here; each layer that
/// owns them wraps `DomainError` in its own error type.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Input rejected before any state changed.
    #[error("validation failed: {0}")]
    Validation(String),

    /// An aggregate refused a transition.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// Optimistic concurrency check failed.
    #[error("conflict: {0}")]
    Conflict(String),

    /// An event payload could not be encoded or decoded.
    #[error("event payload error: {0}")]
    Payload(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn payload(msg: impl Into<String>) -> Self {
        Self::Payload(msg.into())
    }
}

/// The caller's context stopped the operation before it could run.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
    #[error("operation cancelled by caller")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,
}
