//! Read-side queries.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use gatekeeper_core::{AggregateRoot, RequestContext};
use gatekeeper_events::{Query, QueryHandler};

use crate::services::{AuthBackend, AuthServices};
use crate::user::{Email, User, UserId};

/// What queries return about a user. Carries no credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserView {
    pub id: UserId,
    pub email: Email,
    pub created_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub password_changed_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl From<&User> for UserView {
    fn from(user: &User) -> Self {
        Self {
            id: *user.id(),
            email: user.email().clone(),
            created_at: user.created_at(),
            last_login_at: user.last_login_at(),
            password_changed_at: user.password_changed_at(),
            version: user.version(),
        }
    }
}

/// Fails with `AuthError::UserNotFound` for unknown ids.
#[derive(Debug, Clone, Copy)]
pub struct GetUser {
    pub user_id: UserId,
}

impl Query for GetUser {
    type Output = UserView;
    const NAME: &'static str = "get_user";
}

#[derive(Debug, Clone)]
pub struct FindUserByEmail {
    pub email: String,
}

impl Query for FindUserByEmail {
    type Output = Option<UserView>;
    const NAME: &'static str = "find_user_by_email";
}

pub struct GetUserHandler<B: AuthBackend> {
    services: Arc<AuthServices<B>>,
}

impl<B: AuthBackend> GetUserHandler<B> {
    pub fn new(services: Arc<AuthServices<B>>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl<B: AuthBackend> QueryHandler<GetUser> for GetUserHandler<B> {
    async fn handle(&self, ctx: &RequestContext, query: GetUser) -> anyhow::Result<UserView> {
        Ok(self.services.get_user(ctx, query.user_id).await?)
    }
}

pub struct FindUserByEmailHandler<B: AuthBackend> {
    services: Arc<AuthServices<B>>,
}

impl<B: AuthBackend> FindUserByEmailHandler<B> {
    pub fn new(services: Arc<AuthServices<B>>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl<B: AuthBackend> QueryHandler<FindUserByEmail> for FindUserByEmailHandler<B> {
    async fn handle(&self, ctx: &RequestContext, query: FindUserByEmail) -> anyhow::Result<Option<UserView>> {
        Ok(self.services.find_by_email(ctx, &query.email).await?)
    }
}
