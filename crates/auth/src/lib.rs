//! `gatekeeper-auth`: authentication use cases on top of the command core.
//!
//! Registration, login and password change run as commands on the
//! [`CommandBus`](gatekeeper_events::CommandBus): each handler mutates a
//! [`User`] inside one unit of work and stages the user's events in the outbox
//! on the same transaction. Reads go through the
//! [`QueryBus`](gatekeeper_events::QueryBus).
//!
//! HTTP, token issuing and password policy live outside this crate; hashing is
//! an injected [`PasswordHasher`].

pub mod bootstrap;
pub mod commands;
pub mod error;
pub mod password;
pub mod queries;
pub mod repository;
pub mod services;
pub mod user;

pub use bootstrap::{BootstrapError, Collaborators, Gatekeeper, InMemoryGatekeeper, PostgresGatekeeper};
pub use commands::{ChangePassword, Login, LoginResult, RegisterUser};
pub use error::AuthError;
pub use password::PasswordHasher;
pub use queries::{FindUserByEmail, GetUser, UserView};
pub use repository::{InMemoryUserRepository, PostgresUserRepository, UserRepository};
pub use services::{AuthBackend, AuthServices, InMemoryBackend, PostgresBackend, register_handlers};
pub use user::{Email, PasswordHash, User, UserId};
