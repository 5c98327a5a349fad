//! User persistence.

use async_trait::async_trait;

use gatekeeper_core::{AggregateRoot, ExpectedVersion, RequestContext};
use gatekeeper_infra::{InMemoryDatabase, InMemoryStoreError, InMemoryTransaction, TxHandle};

use crate::error::AuthError;
use crate::user::{Email, User, UserId, UserRecord};

pub mod postgres;

pub use postgres::PostgresUserRepository;

/// Storage for users.
///
/// Writes take the unit of work's transaction handle so the user row commits
/// together with the outbox rows staged for its events. Reads see committed
/// state only.
#[async_trait]
pub trait UserRepository: Send + Sync + 'static {
    type Tx: Send + 'static;

    /// Insert a new user. Fails with `EmailTaken` if the email is in use.
    async fn save(&self, ctx: &RequestContext, tx: &TxHandle<Self::Tx>, user: &User) -> Result<(), AuthError>;

    /// Store a changed user. Fails with a `Conflict` domain error if the
    /// stored version is not the one `user` was loaded at, either now or when
    /// the unit of work commits.
    async fn update(&self, ctx: &RequestContext, tx: &TxHandle<Self::Tx>, user: &User) -> Result<(), AuthError>;

    async fn find_by_id(&self, ctx: &RequestContext, id: UserId) -> Result<Option<User>, AuthError>;

    async fn find_by_email(&self, ctx: &RequestContext, email: &Email) -> Result<Option<User>, AuthError>;
}

pub const USERS_TABLE: &str = "users";
pub const USERS_BY_EMAIL_TABLE: &str = "users_by_email";

/// Users in an [`InMemoryDatabase`]: one table of records keyed by id and a
/// unique index from email to id.
#[derive(Debug, Clone)]
pub struct InMemoryUserRepository {
    db: InMemoryDatabase,
}

impl InMemoryUserRepository {
    pub fn new(db: InMemoryDatabase) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    type Tx = InMemoryTransaction;

    async fn save(&self, ctx: &RequestContext, tx: &TxHandle<Self::Tx>, user: &User) -> Result<(), AuthError> {
        ctx.check()?;
        let mut tx = tx.lock().await?;
        let id = user.id().to_string();

        match tx.insert(USERS_BY_EMAIL_TABLE, user.email().as_str(), &id) {
            Err(InMemoryStoreError::DuplicateKey { .. }) => {
                return Err(AuthError::EmailTaken(user.email().to_string()));
            }
            other => other?,
        }
        tx.insert(USERS_TABLE, &id, &user.to_record())?;
        Ok(())
    }

    async fn update(&self, ctx: &RequestContext, tx: &TxHandle<Self::Tx>, user: &User) -> Result<(), AuthError> {
        ctx.check()?;
        let mut tx = tx.lock().await?;
        let id = user.id().to_string();

        let stored: UserRecord = tx
            .get(USERS_TABLE, &id)?
            .ok_or(AuthError::UserNotFound(*user.id()))?;
        ExpectedVersion::Exact(user.persisted_version()).check(stored.version)?;

        // Email never changes after registration, so the index stays valid.
        tx.put_versioned(USERS_TABLE, &id, &user.to_record(), "version", stored.version)?;
        Ok(())
    }

    async fn find_by_id(&self, ctx: &RequestContext, id: UserId) -> Result<Option<User>, AuthError> {
        ctx.check()?;
        let record: Option<UserRecord> = self.db.get(USERS_TABLE, &id.to_string())?;
        Ok(record.map(User::restore))
    }

    async fn find_by_email(&self, ctx: &RequestContext, email: &Email) -> Result<Option<User>, AuthError> {
        ctx.check()?;
        let Some(id) = self.db.get::<String>(USERS_BY_EMAIL_TABLE, email.as_str())? else {
            return Ok(None);
        };
        let record: Option<UserRecord> = self.db.get(USERS_TABLE, &id)?;
        Ok(record.map(User::restore))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use gatekeeper_core::DomainError;
    use gatekeeper_infra::{InMemoryTransactionManager, TransactionError, UnitOfWork};

    use super::*;
    use crate::user::PasswordHash;

    fn user(email: &str) -> User {
        User::register(UserId::new(), Email::parse(email).unwrap(), PasswordHash::new("h"), Utc::now()).unwrap()
    }

    type Uow = UnitOfWork<InMemoryTransactionManager>;

    async fn save(uow: &Uow, repo: &InMemoryUserRepository, user: User) -> Result<(), AuthError> {
        let repo = repo.clone();
        uow.execute(&RequestContext::new(), |ctx, tx| async move { repo.save(&ctx, &tx, &user).await })
            .await
    }

    async fn update(uow: &Uow, repo: &InMemoryUserRepository, user: User) -> Result<(), AuthError> {
        let repo = repo.clone();
        uow.execute(&RequestContext::new(), |ctx, tx| async move { repo.update(&ctx, &tx, &user).await })
            .await
    }

    #[tokio::test]
    async fn saved_users_are_found_by_id_and_email() {
        let db = InMemoryDatabase::new();
        let uow = UnitOfWork::new(Arc::new(InMemoryTransactionManager::new(db.clone())));
        let repo = InMemoryUserRepository::new(db);
        let ada = user("ada@example.com");
        let id = *ada.id();

        save(&uow, &repo, ada).await.unwrap();

        let ctx = RequestContext::new();
        let by_id = repo.find_by_id(&ctx, id).await.unwrap().unwrap();
        assert_eq!(by_id.email().as_str(), "ada@example.com");
        assert_eq!(by_id.version(), 1);
        assert!(by_id.pending_events().is_empty());

        let email = Email::parse("ADA@example.com").unwrap();
        assert_eq!(repo.find_by_email(&ctx, &email).await.unwrap().map(|u| *u.id()), Some(id));
        assert!(repo.find_by_id(&ctx, UserId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected() {
        let db = InMemoryDatabase::new();
        let uow = UnitOfWork::new(Arc::new(InMemoryTransactionManager::new(db.clone())));
        let repo = InMemoryUserRepository::new(db.clone());

        save(&uow, &repo, user("ada@example.com")).await.unwrap();
        let err = save(&uow, &repo, user("ada@example.com")).await.unwrap_err();

        assert_eq!(err, AuthError::EmailTaken("ada@example.com".to_string()));
        assert_eq!(db.len(USERS_TABLE), 1);
    }

    #[tokio::test]
    async fn stale_updates_conflict() {
        let db = InMemoryDatabase::new();
        let uow = UnitOfWork::new(Arc::new(InMemoryTransactionManager::new(db.clone())));
        let repo = InMemoryUserRepository::new(db);
        let ada = user("ada@example.com");
        let id = *ada.id();
        save(&uow, &repo, ada).await.unwrap();

        let ctx = RequestContext::new();
        let mut first = repo.find_by_id(&ctx, id).await.unwrap().unwrap();
        let mut second = first.clone();
        first.login(Utc::now()).unwrap();
        second.login(Utc::now()).unwrap();

        update(&uow, &repo, first).await.unwrap();
        let err = update(&uow, &repo, second).await.unwrap_err();

        assert!(matches!(err, AuthError::Domain(DomainError::Conflict(_))));
        assert_eq!(repo.find_by_id(&ctx, id).await.unwrap().unwrap().version(), 2);
    }

    #[tokio::test]
    async fn racing_updates_conflict_at_commit() {
        let db = InMemoryDatabase::new();
        let manager = Arc::new(InMemoryTransactionManager::new(db.clone()));
        let repo = InMemoryUserRepository::new(db);
        let ada = user("ada@example.com");
        let id = *ada.id();
        save(&UnitOfWork::new(manager.clone()), &repo, ada).await.unwrap();

        let ctx = RequestContext::new();
        let mut first = repo.find_by_id(&ctx, id).await.unwrap().unwrap();
        let mut second = first.clone();
        first.change_password(PasswordHash::new("h2"), Utc::now()).unwrap();
        second.change_password(PasswordHash::new("h3"), Utc::now()).unwrap();

        let uow_a = UnitOfWork::new(manager.clone());
        let uow_b = UnitOfWork::new(manager.clone());
        let tx_a = uow_a.begin(&ctx).await.unwrap();
        let tx_b = uow_b.begin(&ctx).await.unwrap();
        repo.update(&ctx, &tx_a, &first).await.unwrap();
        repo.update(&ctx, &tx_b, &second).await.unwrap();

        uow_a.commit(&tx_a).await.unwrap();
        let err = uow_b.commit(&tx_b).await.unwrap_err();
        assert!(matches!(err, TransactionError::Conflict(_)));
        assert!(matches!(AuthError::from(err), AuthError::Domain(DomainError::Conflict(_))));

        let stored = repo.find_by_id(&ctx, id).await.unwrap().unwrap();
        assert_eq!(stored.version(), 2);
        assert_eq!(stored.password_hash().as_str(), "h2");
    }
}
