use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::auth::{
    otp::{self, OtpCode},
    repo::{StoreError, StoreResult, UserStore},
    repo_types::{NewUser, User, UserChanges},
};

/// Process-local store, used when no database is configured and in tests.
#[derive(Default)]
pub struct MemoryUserStore {
    users: RwLock<HashMap<Uuid, User>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.users.read().await.len()
    }
}

fn email_taken(users: &HashMap<Uuid, User>, email: &str, except: Option<Uuid>) -> bool {
    users
        .values()
        .any(|u| u.email == email && Some(u.id) != except)
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn insert(&self, user: NewUser) -> StoreResult<User> {
        let mut users = self.users.write().await;
        if email_taken(&users, &user.email, None) {
            return Err(StoreError::DuplicateEmail);
        }
        let now = OffsetDateTime::now_utc();
        let record = User {
            id: user.id,
            name: user.name,
            email: user.email,
            password_hash: user.password_hash,
            otp: user.otp.as_ref().map(|o| o.code.clone()),
            otp_expires_at: user.otp.as_ref().map(|o| o.expires_at),
            email_verified_at: user.email_verified_at,
            created_at: now,
            updated_at: now,
        };
        users.insert(record.id, record.clone());
        Ok(record)
    }

    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let users = self.users.read().await;
        Ok(users.values().find(|u| u.email == email).cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<User>> {
        Ok(self.users.read().await.get(&id).cloned())
    }

    async fn set_otp(&self, id: Uuid, otp: Option<&OtpCode>) -> StoreResult<bool> {
        let mut users = self.users.write().await;
        let Some(user) = users.get_mut(&id) else {
            return Ok(false);
        };
        user.otp = otp.map(|o| o.code.clone());
        user.otp_expires_at = otp.map(|o| o.expires_at);
        user.updated_at = OffsetDateTime::now_utc();
        Ok(true)
    }

    async fn consume_otp(
        &self,
        id: Uuid,
        code: &str,
        now: OffsetDateTime,
    ) -> StoreResult<Option<User>> {
        let mut users = self.users.write().await;
        let Some(user) = users.get_mut(&id) else {
            return Ok(None);
        };
        if !otp::matches(user.otp.as_deref(), user.otp_expires_at, code, now) {
            return Ok(None);
        }
        user.otp = None;
        user.otp_expires_at = None;
        if user.email_verified_at.is_none() {
            user.email_verified_at = Some(now);
        }
        user.updated_at = OffsetDateTime::now_utc();
        Ok(Some(user.clone()))
    }

    async fn update(&self, id: Uuid, changes: &UserChanges) -> StoreResult<Option<User>> {
        let mut users = self.users.write().await;
        if !users.contains_key(&id) {
            return Ok(None);
        }
        if let Some(email) = &changes.email {
            if email_taken(&users, email, Some(id)) {
                return Err(StoreError::DuplicateEmail);
            }
        }
        let Some(user) = users.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(name) = &changes.name {
            user.name = name.clone();
        }
        if let Some(email) = &changes.email {
            user.email = email.clone();
        }
        if let Some(hash) = &changes.password_hash {
            user.password_hash = hash.clone();
        }
        user.updated_at = OffsetDateTime::now_utc();
        Ok(Some(user.clone()))
    }

    async fn delete(&self, id: Uuid) -> StoreResult<bool> {
        Ok(self.users.write().await.remove(&id).is_some())
    }
}
