//! In-memory [`UserStore`] for tests and single-process embedders.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

use super::{NewUser, StoreError, User, UserStore, UserUpdate};

/// Hash-map backed store enforcing the same email-uniqueness constraint a
/// production store would.
#[derive(Default)]
pub struct MemoryUserStore {
    users: RwLock<HashMap<Uuid, User>>,
}

impl MemoryUserStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delete a record outright. Not part of [`UserStore`]; deletion belongs
    /// to the admin surface of the embedding application.
    pub fn remove(&self, id: Uuid) -> Option<User> {
        self.users.write().ok()?.remove(&id)
    }
}

fn poisoned() -> StoreError {
    StoreError::Unavailable("store lock poisoned".to_string())
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let users = self.users.read().map_err(|_| poisoned())?;
        Ok(users.get(&id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let users = self.users.read().map_err(|_| poisoned())?;
        Ok(users
            .values()
            .find(|user| user.email.as_deref() == Some(email))
            .cloned())
    }

    async fn find_by_api_key(&self, api_key: &str) -> Result<Option<User>, StoreError> {
        let users = self.users.read().map_err(|_| poisoned())?;
        Ok(users
            .values()
            .find(|user| user.api_key.as_deref() == Some(api_key))
            .cloned())
    }

    async fn insert(&self, new_user: NewUser) -> Result<User, StoreError> {
        let mut users = self.users.write().map_err(|_| poisoned())?;
        if let Some(email) = new_user.email.as_deref() {
            if users
                .values()
                .any(|user| user.email.as_deref() == Some(email))
            {
                return Err(StoreError::DuplicateEmail(email.to_string()));
            }
        }
        let user = User {
            id: Uuid::new_v4(),
            email: new_user.email,
            name: new_user.name,
            role: new_user.role,
            oauth_subject: new_user.oauth_subject,
            api_key: None,
            password_hash: new_user.password_hash,
            created_at: Utc::now(),
            last_active_at: None,
        };
        users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn update_fields(
        &self,
        id: Uuid,
        update: UserUpdate,
    ) -> Result<Option<User>, StoreError> {
        let mut users = self.users.write().map_err(|_| poisoned())?;
        let Some(user) = users.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(name) = update.name {
            user.name = name;
        }
        if let Some(role) = update.role {
            user.role = role;
        }
        if let Some(oauth_subject) = update.oauth_subject {
            user.oauth_subject = Some(oauth_subject);
        }
        if let Some(api_key) = update.api_key {
            user.api_key = api_key;
        }
        if let Some(password_hash) = update.password_hash {
            user.password_hash = Some(password_hash);
        }
        Ok(Some(user.clone()))
    }

    async fn touch_last_active(&self, id: Uuid) -> Result<(), StoreError> {
        let mut users = self.users.write().map_err(|_| poisoned())?;
        if let Some(user) = users.get_mut(&id) {
            user.last_active_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn count_users(&self) -> Result<u64, StoreError> {
        let users = self.users.read().map_err(|_| poisoned())?;
        Ok(users.len() as u64)
    }
}
