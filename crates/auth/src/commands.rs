//! Auth commands and their bus handlers.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use gatekeeper_core::RequestContext;
use gatekeeper_events::{Command, CommandHandler};

use crate::services::{AuthBackend, AuthServices};
use crate::user::{Email, UserId};

/// Create an account. Returns the new user's id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterUser {
    pub email: String,
    pub password: String,
}

impl Command for RegisterUser {
    type Output = UserId;
    const NAME: &'static str = "register_user";

    fn is_nil(&self) -> bool {
        self.email.is_empty() && self.password.is_empty()
    }
}

/// Check credentials and record the login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Login {
    pub email: String,
    pub password: String,
}

impl Command for Login {
    type Output = LoginResult;
    const NAME: &'static str = "login";

    fn is_nil(&self) -> bool {
        self.email.is_empty() && self.password.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoginResult {
    pub user_id: UserId,
    pub email: Email,
    pub logged_in_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangePassword {
    pub user_id: UserId,
    pub current_password: String,
    pub new_password: String,
}

impl Command for ChangePassword {
    type Output = ();
    const NAME: &'static str = "change_password";

    fn is_nil(&self) -> bool {
        self.user_id.as_uuid().is_nil()
    }
}

macro_rules! command_handler {
    ($handler:ident, $command:ty, $method:ident) => {
        pub struct $handler<B: AuthBackend> {
            services: Arc<AuthServices<B>>,
        }

        impl<B: AuthBackend> $handler<B> {
            pub fn new(services: Arc<AuthServices<B>>) -> Self {
                Self { services }
            }
        }

        #[async_trait]
        impl<B: AuthBackend> CommandHandler<$command> for $handler<B> {
            async fn handle(
                &self,
                ctx: &RequestContext,
                command: $command,
            ) -> anyhow::Result<<$command as Command>::Output> {
                Ok(self.services.$method(ctx, command).await?)
            }
        }
    };
}

command_handler!(RegisterUserHandler, RegisterUser, register);
command_handler!(LoginHandler, Login, login);
command_handler!(ChangePasswordHandler, ChangePassword, change_password);
