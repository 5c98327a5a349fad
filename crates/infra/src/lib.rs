//! Infrastructure layer: transactions, the outbox, background workers, config.

pub mod config;
pub mod outbox;
pub mod uow;
pub mod workers;


pub use config::{ConfigError, GatekeeperConfig};
pub use outbox::{
    InMemoryOutboxRepository, OutboxError, OutboxEvent, OutboxProcessor, OutboxProcessorConfig,
    OutboxRepository, OutboxStatus, OutboxWriter, PostgresOutboxRepository, ProcessReport,
};
pub use uow::{
    InMemoryDatabase, InMemoryStoreError, InMemoryTransaction, InMemoryTransactionManager,
    PostgresTransactionManager, TransactionError, TransactionManager, TxHandle, UnitOfWork,
    UnitOfWorkFactory,
};
pub use workers::{OutboxWorker, WorkerHandle};
