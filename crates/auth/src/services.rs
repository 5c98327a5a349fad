//! Use-case services and their wiring onto the buses.

use std::sync::Arc;

use chrono::Utc;

use gatekeeper_core::{AggregateRoot, DomainError, RequestContext};
use gatekeeper_events::{BusError, CommandBus, QueryBus};
use gatekeeper_infra::{
    InMemoryOutboxRepository, InMemoryTransaction, InMemoryTransactionManager, OutboxRepository,
    OutboxWriter, PostgresOutboxRepository, PostgresTransactionManager, TransactionManager,
    UnitOfWorkFactory,
};
use sqlx::{Postgres, Transaction};

use crate::commands::{
    ChangePassword, ChangePasswordHandler, Login, LoginHandler, LoginResult, RegisterUser,
    RegisterUserHandler,
};
use crate::error::AuthError;
use crate::password::PasswordHasher;
use crate::queries::{FindUserByEmail, FindUserByEmailHandler, GetUser, GetUserHandler, UserView};
use crate::repository::{InMemoryUserRepository, PostgresUserRepository, UserRepository};
use crate::user::{Email, User, UserId};

/// The storage stack the services run on. All three parts share one
/// transaction type, so the user row and its outbox rows commit together.
pub trait AuthBackend: Send + Sync + 'static {
    type Tx: Send + 'static;
    type Transactions: TransactionManager<Tx = Self::Tx>;
    type Users: UserRepository<Tx = Self::Tx>;
    type Outbox: OutboxRepository<Tx = Self::Tx>;
}

/// [`AuthBackend`] over an `InMemoryDatabase`.
#[derive(Debug, Clone, Copy, Default)]
pub struct InMemoryBackend;

impl AuthBackend for InMemoryBackend {
    type Tx = InMemoryTransaction;
    type Transactions = InMemoryTransactionManager;
    type Users = InMemoryUserRepository;
    type Outbox = InMemoryOutboxRepository;
}

/// [`AuthBackend`] over one Postgres pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresBackend;

impl AuthBackend for PostgresBackend {
    type Tx = Transaction<'static, Postgres>;
    type Transactions = PostgresTransactionManager;
    type Users = PostgresUserRepository;
    type Outbox = PostgresOutboxRepository;
}

enum Persist {
    Insert,
    Update,
}

/// Registration, login and password change.
///
/// Every state change runs in its own unit of work: the user row is written,
/// its pending events are staged in the outbox on the same transaction, and
/// only after the commit succeeds are the events drained from the aggregate.
pub struct AuthServices<B: AuthBackend> {
    uow: UnitOfWorkFactory<B::Transactions>,
    users: Arc<B::Users>,
    outbox: OutboxWriter<B::Outbox>,
    hasher: Arc<dyn PasswordHasher>,
}

impl<B: AuthBackend> AuthServices<B> {
    pub fn new(
        uow: UnitOfWorkFactory<B::Transactions>,
        users: Arc<B::Users>,
        outbox: OutboxWriter<B::Outbox>,
        hasher: Arc<dyn PasswordHasher>,
    ) -> Self {
        Self {
            uow,
            users,
            outbox,
            hasher,
        }
    }

    pub async fn register(&self, ctx: &RequestContext, cmd: RegisterUser) -> Result<UserId, AuthError> {
        let email = Email::parse(&cmd.email)?;
        if cmd.password.is_empty() {
            return Err(DomainError::validation("password must not be empty").into());
        }
        let hash = self.hasher.hash(&cmd.password)?;
        let user = User::register(UserId::new(), email, hash, Utc::now())?;

        let mut user = self.persist(ctx, user, Persist::Insert).await?;
        let staged = user.take_events();
        tracing::info!(user_id = %user.id(), events = staged.len(), "user registered");
        Ok(*user.id())
    }

    pub async fn login(&self, ctx: &RequestContext, cmd: Login) -> Result<LoginResult, AuthError> {
        let email = Email::parse(&cmd.email).map_err(|_| AuthError::InvalidCredentials)?;
        let Some(mut user) = self.users.find_by_email(ctx, &email).await? else {
            tracing::info!("login rejected: unknown email");
            return Err(AuthError::InvalidCredentials);
        };
        if !self.hasher.verify(&cmd.password, user.password_hash()) {
            tracing::info!(user_id = %user.id(), "login rejected: wrong password");
            return Err(AuthError::InvalidCredentials);
        }

        let now = Utc::now();
        user.login(now)?;
        let mut user = self.persist(ctx, user, Persist::Update).await?;
        user.take_events();

        tracing::info!(user_id = %user.id(), "user logged in");
        Ok(LoginResult {
            user_id: *user.id(),
            email: user.email().clone(),
            logged_in_at: now,
        })
    }

    pub async fn change_password(&self, ctx: &RequestContext, cmd: ChangePassword) -> Result<(), AuthError> {
        let mut user = self
            .users
            .find_by_id(ctx, cmd.user_id)
            .await?
            .ok_or(AuthError::UserNotFound(cmd.user_id))?;
        if !self.hasher.verify(&cmd.current_password, user.password_hash()) {
            return Err(AuthError::InvalidCredentials);
        }
        if cmd.new_password.is_empty() {
            return Err(DomainError::validation("password must not be empty").into());
        }
        if self.hasher.verify(&cmd.new_password, user.password_hash()) {
            return Err(DomainError::validation("new password must differ from the current one").into());
        }

        let hash = self.hasher.hash(&cmd.new_password)?;
        user.change_password(hash, Utc::now())?;
        let mut user = self.persist(ctx, user, Persist::Update).await?;
        user.take_events();

        tracing::info!(user_id = %user.id(), "password changed");
        Ok(())
    }

    pub async fn get_user(&self, ctx: &RequestContext, user_id: UserId) -> Result<UserView, AuthError> {
        self.users
            .find_by_id(ctx, user_id)
            .await?
            .map(|user| UserView::from(&user))
            .ok_or(AuthError::UserNotFound(user_id))
    }

    pub async fn find_by_email(&self, ctx: &RequestContext, email: &str) -> Result<Option<UserView>, AuthError> {
        let email = Email::parse(email)?;
        Ok(self
            .users
            .find_by_email(ctx, &email)
            .await?
            .map(|user| UserView::from(&user)))
    }

    /// Write `user` and stage its pending events in one unit of work.
    async fn persist(&self, ctx: &RequestContext, user: User, mode: Persist) -> Result<User, AuthError> {
        let users = Arc::clone(&self.users);
        let outbox = self.outbox.clone();

        self.uow
            .create()
            .execute(ctx, |ctx, tx| async move {
                match mode {
                    Persist::Insert => users.save(&ctx, &tx, &user).await?,
                    Persist::Update => users.update(&ctx, &tx, &user).await?,
                }
                outbox.write(&ctx, &tx, user.pending_events()).await?;
                Ok::<_, AuthError>(user)
            })
            .await
    }
}

/// Register every auth command and query handler.
pub fn register_handlers<B: AuthBackend>(
    services: &Arc<AuthServices<B>>,
    commands: &CommandBus,
    queries: &QueryBus,
) -> Result<(), BusError> {
    commands.register::<RegisterUser, _>(RegisterUserHandler::new(Arc::clone(services)))?;
    commands.register::<Login, _>(LoginHandler::new(Arc::clone(services)))?;
    commands.register::<ChangePassword, _>(ChangePasswordHandler::new(Arc::clone(services)))?;
    queries.register::<GetUser, _>(GetUserHandler::new(Arc::clone(services)))?;
    queries.register::<FindUserByEmail, _>(FindUserByEmailHandler::new(Arc::clone(services)))?;
    Ok(())
}
