//! Background workers.

pub mod outbox_worker;

pub use outbox_worker::{OutboxWorker, WorkerHandle};
