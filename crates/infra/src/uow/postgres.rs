use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};

use super::{TransactionError, TransactionManager};

/// Transaction manager over a sqlx Postgres pool.
///
/// Repositories participating in a unit of work run their statements on the
/// handle's transaction (`&mut **guard`), never on the pool.
#[derive(Debug, Clone)]
pub struct PostgresTransactionManager {
    pool: PgPool,
}

impl PostgresTransactionManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TransactionManager for PostgresTransactionManager {
    type Tx = Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Tx, TransactionError> {
        self.pool
            .begin()
            .await
            .map_err(|e| TransactionError::Begin(e.to_string()))
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), TransactionError> {
        tx.commit()
            .await
            .map_err(|e| TransactionError::Commit(e.to_string()))
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), TransactionError> {
        tx.rollback()
            .await
            .map_err(|e| TransactionError::Rollback(e.to_string()))
    }
}
