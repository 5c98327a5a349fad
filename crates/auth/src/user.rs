//! User aggregate and its value objects.
//!
//! State is stored as a [`UserRecord`] row; every domain method appends one
//! event to the user's [`EventBuffer`] and bumps the version.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use gatekeeper_core::{
    AggregateId, AggregateRoot, DomainError, DomainEvent, DomainResult, EventBuffer, ValueObject,
};

pub const USER_CREATED: &str = "user.created";
pub const USER_LOGGED_IN: &str = "user.logged_in";
pub const USER_PASSWORD_CHANGED: &str = "user.password_changed";

// ─────────────────────────────────────────────────────────────────────────────
// Identifiers and value objects
// ─────────────────────────────────────────────────────────────────────────────

gatekeeper_core::uuid_id!(
    /// Identifier of a registered account; also its aggregate id.
    UserId
);

impl From<UserId> for AggregateId {
    fn from(value: UserId) -> Self {
        AggregateId::from_uuid(value.0)
    }
}

impl From<AggregateId> for UserId {
    fn from(value: AggregateId) -> Self {
        Self(*value.as_uuid())
    }
}

/// A normalized (trimmed, lowercased) email address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Email(String);

impl Email {
    pub fn parse(raw: &str) -> DomainResult<Self> {
        let normalized = raw.trim().to_lowercase();
        let valid = match normalized.split_once('@') {
            Some((local, domain)) => {
                !local.is_empty()
                    && !domain.is_empty()
                    && !domain.contains('@')
                    && !normalized.contains(char::is_whitespace)
            }
            None => false,
        };
        if !valid {
            return Err(DomainError::validation(format!("invalid email `{}`", raw.trim())));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Email {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl ValueObject for Email {}

/// Output of a [`PasswordHasher`](crate::PasswordHasher). Never printed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PasswordHash(String);

impl PasswordHash {
    pub fn new(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Debug for PasswordHash {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("PasswordHash(***)")
    }
}

impl ValueObject for PasswordHash {}

// ─────────────────────────────────────────────────────────────────────────────
// Event payloads
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCreated {
    pub user_id: UserId,
    pub email: Email,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserLoggedIn {
    pub user_id: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPasswordChanged {
    pub user_id: UserId,
    pub occurred_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Aggregate
// ─────────────────────────────────────────────────────────────────────────────

/// Persisted shape of a [`User`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub email: Email,
    pub password_hash: PasswordHash,
    pub created_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub password_changed_at: Option<DateTime<Utc>>,
    pub version: u64,
}

/// A registered account.
///
/// # Invariants
/// - `email` is unique across users (enforced by the repository).
/// - `version` counts every event the user ever recorded.
/// - Pending events are drained once, by the handler, after the unit of work
///   that persisted them commits.
#[derive(Debug, Clone)]
pub struct User {
    id: UserId,
    email: Email,
    password_hash: PasswordHash,
    created_at: DateTime<Utc>,
    last_login_at: Option<DateTime<Utc>>,
    password_changed_at: Option<DateTime<Utc>>,
    version: u64,
    events: EventBuffer,
}

impl User {
    /// Create a new user, recording `user.created`.
    pub fn register(
        id: UserId,
        email: Email,
        password_hash: PasswordHash,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let mut user = Self {
            id,
            email: email.clone(),
            password_hash,
            created_at: now,
            last_login_at: None,
            password_changed_at: None,
            version: 0,
            events: EventBuffer::new(),
        };
        user.record(
            USER_CREATED,
            &UserCreated {
                user_id: id,
                email,
                occurred_at: now,
            },
            now,
        )?;
        Ok(user)
    }

    /// Rebuild a user from storage. No events are pending.
    pub fn restore(record: UserRecord) -> Self {
        Self {
            id: record.id,
            email: record.email,
            password_hash: record.password_hash,
            created_at: record.created_at,
            last_login_at: record.last_login_at,
            password_changed_at: record.password_changed_at,
            version: record.version,
            events: EventBuffer::new(),
        }
    }

    pub fn to_record(&self) -> UserRecord {
        UserRecord {
            id: self.id,
            email: self.email.clone(),
            password_hash: self.password_hash.clone(),
            created_at: self.created_at,
            last_login_at: self.last_login_at,
            password_changed_at: self.password_changed_at,
            version: self.version,
        }
    }

    pub fn login(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.last_login_at = Some(now);
        self.record(
            USER_LOGGED_IN,
            &UserLoggedIn {
                user_id: self.id,
                occurred_at: now,
            },
            now,
        )
    }

    pub fn change_password(&mut self, new_hash: PasswordHash, now: DateTime<Utc>) -> DomainResult<()> {
        if new_hash == self.password_hash {
            return Err(DomainError::invariant("new password must differ from the current one"));
        }
        self.password_hash = new_hash;
        self.password_changed_at = Some(now);
        self.record(
            USER_PASSWORD_CHANGED,
            &UserPasswordChanged {
                user_id: self.id,
                occurred_at: now,
            },
            now,
        )
    }

    pub fn email(&self) -> &Email {
        &self.email
    }

    pub fn password_hash(&self) -> &PasswordHash {
        &self.password_hash
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_login_at(&self) -> Option<DateTime<Utc>> {
        self.last_login_at
    }

    pub fn password_changed_at(&self) -> Option<DateTime<Utc>> {
        self.password_changed_at
    }

    fn record<P: Serialize>(&mut self, name: &str, payload: &P, now: DateTime<Utc>) -> DomainResult<()> {
        let event = DomainEvent::from_payload(name, self.id.into(), payload)?.with_occurred_at(now);
        self.events.record(event);
        self.version += 1;
        Ok(())
    }
}

impl AggregateRoot for User {
    type Id = UserId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn pending_events(&self) -> &[DomainEvent] {
        self.events.pending()
    }

    fn take_events(&mut self) -> Vec<DomainEvent> {
        self.events.drain()
    }
}
