//! User store collaborator interface.
//!
//! Identity records are owned by the embedding application's store; this
//! crate only reads them and requests upserts through [`UserStore`]. The
//! store is responsible for enforcing email uniqueness; the resolver treats
//! a [`StoreError::DuplicateEmail`] on insert as "somebody else won the
//! race, re-fetch" rather than a fatal error.

mod memory;

pub use memory::MemoryUserStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Privilege level attached to an identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    /// Provisioned but awaiting activation by an administrator.
    #[default]
    Pending,
    User,
    Admin,
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::User => "user",
            Self::Admin => "admin",
        };
        f.write_str(label)
    }
}

impl FromStr for UserRole {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "user" => Ok(Self::User),
            "admin" => Ok(Self::Admin),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// A stored identity record.
///
/// `id` is unique and immutable once assigned; `email`, when present, is
/// unique across all records.
#[derive(Debug, Clone)]
pub struct User {
    pub id: Uuid,
    pub email: Option<String>,
    pub name: String,
    pub role: UserRole,
    /// Opaque subject identifier from the external provider, set on first
    /// external login.
    pub oauth_subject: Option<String>,
    pub api_key: Option<String>,
    pub password_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: Option<DateTime<Utc>>,
}

/// Fields for a new identity record; the store assigns `id` and timestamps.
#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub email: Option<String>,
    pub name: String,
    pub role: UserRole,
    pub oauth_subject: Option<String>,
    pub password_hash: Option<String>,
}

/// Partial update; `None` leaves a field untouched. `api_key` is doubly
/// optional so a stored key can be removed.
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub name: Option<String>,
    pub role: Option<UserRole>,
    pub oauth_subject: Option<String>,
    pub api_key: Option<Option<String>>,
    pub password_hash: Option<String>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// Unique-constraint violation on email.
    #[error("duplicate email: {0}")]
    DuplicateEmail(String),

    /// The store could not be reached or failed internally.
    #[error("user store unavailable: {0}")]
    Unavailable(String),
}

/// Narrow interface to the identity store collaborator.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError>;

    /// Lookup by already-normalized (trimmed, lowercased) email.
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;

    async fn find_by_api_key(&self, api_key: &str) -> Result<Option<User>, StoreError>;

    /// Insert a new record. Fails with [`StoreError::DuplicateEmail`] when
    /// the email is already taken.
    async fn insert(&self, new_user: NewUser) -> Result<User, StoreError>;

    /// Apply a partial update; returns the updated record, or `None` when no
    /// record with this id exists.
    async fn update_fields(&self, id: Uuid, update: UserUpdate)
        -> Result<Option<User>, StoreError>;

    /// Refresh the last-active timestamp. Callers treat this as
    /// fire-and-forget; it is never on the authorization decision path.
    async fn touch_last_active(&self, id: Uuid) -> Result<(), StoreError>;

    async fn count_users(&self) -> Result<u64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips_through_display() {
        for role in [UserRole::Pending, UserRole::User, UserRole::Admin] {
            assert_eq!(role.to_string().parse::<UserRole>(), Ok(role));
        }
    }

    #[test]
    fn role_rejects_unknown() {
        assert!("superuser".parse::<UserRole>().is_err());
    }

    #[test]
    fn role_default_is_pending() {
        assert_eq!(UserRole::default(), UserRole::Pending);
    }
}
