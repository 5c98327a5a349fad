//! Composition roots.
//!
//! The process entry point installs the tracing subscriber
//! (`gatekeeper_observability::init`), reads [`GatekeeperConfig`] and builds
//! one [`Gatekeeper`]: [`PostgresGatekeeper::connect`] when `DATABASE_URL` is
//! set, [`InMemoryGatekeeper::build`] otherwise. Consumers then register their
//! [`EventHandler`](gatekeeper_events::EventHandler)s on `dispatcher` and
//! start the outbox worker.

use std::sync::Arc;

use sqlx::PgPool;
use thiserror::Error;

use gatekeeper_events::{BusError, CommandBus, EventDispatcher, JsonEventSerializer, QueryBus};
use gatekeeper_infra::{
    GatekeeperConfig, InMemoryDatabase, InMemoryOutboxRepository, InMemoryTransactionManager,
    OutboxProcessor, OutboxWorker, OutboxWriter, PostgresOutboxRepository,
    PostgresTransactionManager, UnitOfWorkFactory, WorkerHandle,
};
use gatekeeper_observability::{MetricsRecorder, Tracer};

use crate::password::PasswordHasher;
use crate::repository::{InMemoryUserRepository, PostgresUserRepository};
use crate::services::{AuthBackend, AuthServices, InMemoryBackend, PostgresBackend, register_handlers};

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("DATABASE_URL is not set")]
    MissingDatabaseUrl,

    #[error("failed to connect to Postgres: {0}")]
    Connect(String),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Collaborators every composition root takes from the caller.
pub struct Collaborators {
    pub hasher: Arc<dyn PasswordHasher>,
    pub tracer: Arc<dyn Tracer>,
    pub metrics: Arc<dyn MetricsRecorder>,
}

/// Buses, dispatcher and outbox processor wired over one backend.
pub struct Gatekeeper<B: AuthBackend> {
    pub commands: CommandBus,
    pub queries: QueryBus,
    pub dispatcher: Arc<EventDispatcher>,
    pub processor: Arc<OutboxProcessor<B::Outbox>>,
    pub services: Arc<AuthServices<B>>,
    pub outbox: Arc<B::Outbox>,
    config: GatekeeperConfig,
}

pub type InMemoryGatekeeper = Gatekeeper<InMemoryBackend>;
pub type PostgresGatekeeper = Gatekeeper<PostgresBackend>;

impl<B: AuthBackend> Gatekeeper<B> {
    fn assemble(
        config: GatekeeperConfig,
        transactions: Arc<B::Transactions>,
        users: Arc<B::Users>,
        outbox: Arc<B::Outbox>,
        collaborators: Collaborators,
    ) -> Result<Self, BusError> {
        let Collaborators {
            hasher,
            tracer,
            metrics,
        } = collaborators;
        let serializer = Arc::new(JsonEventSerializer);

        let services = Arc::new(AuthServices::<B>::new(
            UnitOfWorkFactory::new(transactions),
            users,
            OutboxWriter::new(Arc::clone(&outbox), serializer.clone()),
            hasher,
        ));

        let commands = CommandBus::with_observability(
            Arc::clone(&tracer),
            Arc::clone(&metrics),
            config.slow_operation_threshold,
        );
        let queries =
            QueryBus::with_observability(tracer, Arc::clone(&metrics), config.slow_operation_threshold);
        register_handlers(&services, &commands, &queries)?;

        let dispatcher =
            Arc::new(EventDispatcher::new(config.dispatch_mode).with_metrics(Arc::clone(&metrics)));
        let processor = Arc::new(
            OutboxProcessor::new(
                Arc::clone(&outbox),
                Arc::clone(&dispatcher),
                serializer,
                config.outbox.clone(),
            )
            .with_metrics(metrics),
        );

        Ok(Self {
            commands,
            queries,
            dispatcher,
            processor,
            services,
            outbox,
            config,
        })
    }

    pub fn config(&self) -> &GatekeeperConfig {
        &self.config
    }

    /// Start polling the outbox at the configured interval.
    pub fn spawn_outbox_worker(&self) -> WorkerHandle {
        OutboxWorker::spawn(
            "outbox",
            Arc::clone(&self.processor),
            self.config.outbox_poll_interval,
        )
    }
}

impl Gatekeeper<InMemoryBackend> {
    pub fn build(config: GatekeeperConfig, collaborators: Collaborators) -> Result<Self, BusError> {
        let database = InMemoryDatabase::new();
        let gatekeeper = Self::assemble(
            config,
            Arc::new(InMemoryTransactionManager::new(database.clone())),
            Arc::new(InMemoryUserRepository::new(database.clone())),
            Arc::new(InMemoryOutboxRepository::new(database)),
            collaborators,
        )?;

        tracing::info!(
            backend = "in-memory",
            dispatch_mode = %gatekeeper.config.dispatch_mode,
            batch_size = gatekeeper.config.outbox.batch_size,
            "gatekeeper ready"
        );
        Ok(gatekeeper)
    }

    /// The shared store behind users, transactions and the outbox.
    pub fn database(&self) -> &InMemoryDatabase {
        self.outbox.database()
    }
}

impl Gatekeeper<PostgresBackend> {
    /// Connect to `config.database_url`. The `users` and `outbox_events`
    /// migrations must already be applied.
    pub async fn connect(config: GatekeeperConfig, collaborators: Collaborators) -> Result<Self, BootstrapError> {
        let url = config
            .database_url
            .clone()
            .ok_or(BootstrapError::MissingDatabaseUrl)?;
        let pool = PgPool::connect(&url)
            .await
            .map_err(|e| BootstrapError::Connect(e.to_string()))?;
        Ok(Self::from_pool(pool, config, collaborators)?)
    }

    /// Wire every part over `pool`; all of them share its connections.
    pub fn from_pool(pool: PgPool, config: GatekeeperConfig, collaborators: Collaborators) -> Result<Self, BusError> {
        let gatekeeper = Self::assemble(
            config,
            Arc::new(PostgresTransactionManager::new(pool.clone())),
            Arc::new(PostgresUserRepository::new(pool.clone())),
            Arc::new(PostgresOutboxRepository::new(pool)),
            collaborators,
        )?;

        tracing::info!(
            backend = "postgres",
            dispatch_mode = %gatekeeper.config.dispatch_mode,
            batch_size = gatekeeper.config.outbox.batch_size,
            "gatekeeper ready"
        );
        Ok(gatekeeper)
    }
}
