use thiserror::Error;

use gatekeeper_core::{ContextError, DomainError};
use gatekeeper_infra::{InMemoryStoreError, OutboxError, TransactionError};

use crate::user::UserId;

/// Failures of the auth use cases.
///
/// Handlers return these through `anyhow`, so callers of the bus recover them
/// with `BusError::downcast_ref::<AuthError>()`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("email `{0}` is already registered")]
    EmailTaken(String),

    /// Unknown email or wrong password; the two are not told apart.
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("user {0} not found")]
    UserNotFound(UserId),

    #[error("password hashing failed: {0}")]
    Hashing(String),

    #[error("user storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Transaction(TransactionError),

    #[error(transparent)]
    Outbox(#[from] OutboxError),

    #[error(transparent)]
    Context(#[from] ContextError),
}

impl From<InMemoryStoreError> for AuthError {
    fn from(err: InMemoryStoreError) -> Self {
        AuthError::Storage(err.to_string())
    }
}

/// A guarded write that lost a race at commit is the same stale-version
/// conflict the repository reports up front.
impl From<TransactionError> for AuthError {
    fn from(err: TransactionError) -> Self {
        match err {
            TransactionError::Conflict(msg) => AuthError::Domain(DomainError::conflict(msg)),
            other => AuthError::Transaction(other),
        }
    }
}
