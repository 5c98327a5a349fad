//! Unit of work: one transaction per logical operation.
//!
//! ```text
//!   idle ──begin──▶ active ──commit / rollback──▶ idle
//! ```
//!
//! [`UnitOfWork::execute`] wraps a closure in begin/commit, rolling back when
//! the closure fails or panics. The closure receives the [`TxHandle`] every
//! repository write inside it must go through; a repository that opens its
//! own connection instead breaks atomicity.
//!
//! A `UnitOfWork` holds at most one live transaction. Concurrent requests each
//! take their own instance from a [`UnitOfWorkFactory`].

use core::fmt;
use core::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{OwnedMappedMutexGuard, OwnedMutexGuard};
use uuid::Uuid;

use gatekeeper_core::{ContextError, RequestContext};
use gatekeeper_events::panic::panic_message;

pub mod in_memory;
pub mod postgres;

pub use in_memory::{InMemoryDatabase, InMemoryStoreError, InMemoryTransaction, InMemoryTransactionManager};
pub use postgres::PostgresTransactionManager;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("a transaction is already active on this unit of work")]
    AlreadyActive,

    #[error("no active transaction")]
    NotActive,

    /// The handle's transaction was already committed or rolled back.
    #[error("transaction handle is closed")]
    Closed,

    #[error("failed to begin transaction: {0}")]
    Begin(String),

    #[error("failed to commit transaction: {0}")]
    Commit(String),

    /// A row the transaction wrote was changed by another commit first.
    #[error("transaction conflict: {0}")]
    Conflict(String),

    #[error("failed to roll back transaction: {0}")]
    Rollback(String),

    #[error("unit of work panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Context(#[from] ContextError),
}

/// Opens and finishes backend transactions.
#[async_trait]
pub trait TransactionManager: Send + Sync + 'static {
    type Tx: Send + 'static;

    async fn begin(&self) -> Result<Self::Tx, TransactionError>;

    async fn commit(&self, tx: Self::Tx) -> Result<(), TransactionError>;

    async fn rollback(&self, tx: Self::Tx) -> Result<(), TransactionError>;
}

#[async_trait]
impl<M: TransactionManager> TransactionManager for Arc<M> {
    type Tx = M::Tx;

    async fn begin(&self) -> Result<Self::Tx, TransactionError> {
        (**self).begin().await
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), TransactionError> {
        (**self).commit(tx).await
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), TransactionError> {
        (**self).rollback(tx).await
    }
}

/// Shared handle to the transaction of one unit of work.
///
/// Clones refer to the same transaction. Once the unit of work commits or
/// rolls back, [`TxHandle::lock`] returns `TransactionError::Closed`.
pub struct TxHandle<T> {
    id: Uuid,
    inner: Arc<tokio::sync::Mutex<Option<T>>>,
}

impl<T> Clone for TxHandle<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for TxHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxHandle").field("id", &self.id).finish()
    }
}

impl<T> TxHandle<T> {
    pub fn new(tx: T) -> Self {
        Self {
            id: Uuid::now_v7(),
            inner: Arc::new(tokio::sync::Mutex::new(Some(tx))),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Exclusive access to the live transaction.
    ///
    /// Writes on one handle are serialized; do not hold the guard across
    /// another `lock` on the same handle.
    pub async fn lock(&self) -> Result<OwnedMappedMutexGuard<Option<T>, T>, TransactionError> {
        let guard = Arc::clone(&self.inner).lock_owned().await;
        OwnedMutexGuard::try_map(guard, Option::as_mut).map_err(|_| TransactionError::Closed)
    }

    pub async fn is_open(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    async fn take(&self) -> Option<T> {
        self.inner.lock().await.take()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Active(Uuid),
}

pub struct UnitOfWork<M: TransactionManager> {
    manager: Arc<M>,
    state: Mutex<State>,
}

impl<M: TransactionManager> fmt::Debug for UnitOfWork<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("state", &*self.state.lock().unwrap_or_else(PoisonError::into_inner))
            .finish()
    }
}

impl<M: TransactionManager> UnitOfWork<M> {
    pub fn new(manager: Arc<M>) -> Self {
        Self {
            manager,
            state: Mutex::new(State::Idle),
        }
    }

    pub fn is_in_transaction(&self) -> bool {
        matches!(
            *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            State::Active(_)
        )
    }

    fn set_state(&self, state: State) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Open a transaction. Fails with `AlreadyActive` while one is open.
    pub async fn begin(&self, ctx: &RequestContext) -> Result<TxHandle<M::Tx>, TransactionError> {
        ctx.check()?;

        let reservation = Uuid::now_v7();
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != State::Idle {
                return Err(TransactionError::AlreadyActive);
            }
            *state = State::Active(reservation);
        }
        // Frees the reservation if the backend fails or this future is dropped.
        let _reserved = ResetOnDrop::new(&self.state, reservation);

        let tx = self.manager.begin().await?;
        let handle = TxHandle::new(tx);
        self.set_state(State::Active(handle.id()));
        tracing::debug!(tx_id = %handle.id(), "transaction started");
        Ok(handle)
    }

    pub async fn commit(&self, handle: &TxHandle<M::Tx>) -> Result<(), TransactionError> {
        let tx = self.close(handle).await?;
        let result = self.manager.commit(tx).await;
        match &result {
            Ok(()) => tracing::debug!(tx_id = %handle.id(), "transaction committed"),
            Err(err) => tracing::warn!(tx_id = %handle.id(), error = %err, "commit failed"),
        }
        result
    }

    pub async fn rollback(&self, handle: &TxHandle<M::Tx>) -> Result<(), TransactionError> {
        let tx = self.close(handle).await?;
        self.manager.rollback(tx).await?;
        tracing::debug!(tx_id = %handle.id(), "transaction rolled back");
        Ok(())
    }

    /// Takes the transaction out of `handle` and returns the unit of work to
    /// idle, whatever the backend does with the transaction afterwards.
    async fn close(&self, handle: &TxHandle<M::Tx>) -> Result<M::Tx, TransactionError> {
        if *self.state.lock().unwrap_or_else(PoisonError::into_inner) != State::Active(handle.id()) {
            return Err(TransactionError::NotActive);
        }
        let tx = handle.take().await.ok_or(TransactionError::Closed)?;
        self.set_state(State::Idle);
        Ok(tx)
    }

    /// Run `f` inside a transaction.
    ///
    /// Commits iff `f` returns `Ok`. On error the transaction is rolled back
    /// and `f`'s error is returned unchanged; a panic in `f` is caught, rolled
    /// back and returned as `TransactionError::Panicked`. A failed commit is
    /// returned as `TransactionError::Commit`, or `Conflict` when a guarded
    /// write lost a race.
    pub async fn execute<F, Fut, T, E>(&self, ctx: &RequestContext, f: F) -> Result<T, E>
    where
        F: FnOnce(RequestContext, TxHandle<M::Tx>) -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        E: From<TransactionError>,
    {
        let handle = self.begin(ctx).await?;
        let _active = ResetOnDrop::new(&self.state, handle.id());

        let scoped_ctx = ctx.clone();
        let scoped_handle = handle.clone();
        let outcome = AssertUnwindSafe(async move { f(scoped_ctx, scoped_handle).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(value)) => {
                self.commit(&handle).await?;
                Ok(value)
            }
            Ok(Err(err)) => {
                self.rollback_logged(&handle, "unit of work failed").await;
                Err(err)
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(tx_id = %handle.id(), panic = %message, "unit of work panicked");
                self.rollback_logged(&handle, "unit of work panicked").await;
                Err(TransactionError::Panicked(message).into())
            }
        }
    }

    async fn rollback_logged(&self, handle: &TxHandle<M::Tx>, reason: &str) {
        if let Err(err) = self.rollback(handle).await {
            tracing::error!(tx_id = %handle.id(), error = %err, reason, "rollback failed");
        }
    }
}

/// Returns the unit of work to idle on drop if `id` still holds it. A caller
/// that drops `execute` mid-flight leaves the unit of work reusable; the
/// backend transaction is released when its last handle drops.
struct ResetOnDrop<'a> {
    state: &'a Mutex<State>,
    id: Uuid,
}

impl<'a> ResetOnDrop<'a> {
    fn new(state: &'a Mutex<State>, id: Uuid) -> Self {
        Self { state, id }
    }
}

impl Drop for ResetOnDrop<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == State::Active(self.id) {
            *state = State::Idle;
        }
    }
}

/// Hands out one [`UnitOfWork`] per logical operation over a shared manager.
pub struct UnitOfWorkFactory<M: TransactionManager> {
    manager: Arc<M>,
}

impl<M: TransactionManager> Clone for UnitOfWorkFactory<M> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
        }
    }
}

impl<M: TransactionManager> UnitOfWorkFactory<M> {
    pub fn new(manager: Arc<M>) -> Self {
        Self { manager }
    }

    pub fn create(&self) -> UnitOfWork<M> {
        UnitOfWork::new(Arc::clone(&self.manager))
    }

    pub fn manager(&self) -> &Arc<M> {
        &self.manager
    }
}
