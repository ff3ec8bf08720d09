//! In-memory collaborators, used when no database is configured and in tests.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;

use beacon_common::id::{prefix, prefixed_ulid};
use beacon_common::SnowflakeGenerator;

use super::{CredentialPolicy, CredentialStore, MessageLog};
use crate::auth::password::CredentialHasher;
use crate::error::HubError;
use crate::models::message::{Message, NewMessage};
use crate::models::user::{NewCredentials, User, UserProfile};

pub struct MemoryCredentialStore {
    users: DashMap<String, User>,
    /// Lowercased username to user id.
    usernames: DashMap<String, String>,
    hasher: CredentialHasher,
    policy: CredentialPolicy,
}

impl MemoryCredentialStore {
    pub fn new(hasher: CredentialHasher, policy: CredentialPolicy) -> Self {
        Self {
            users: DashMap::new(),
            usernames: DashMap::new(),
            hasher,
            policy,
        }
    }

    /// Current online flag for a user, if the user exists.
    pub fn is_online(&self, user_id: &str) -> Option<bool> {
        self.users.get(user_id).map(|u| u.is_online)
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn create_user(&self, new: NewCredentials) -> Result<UserProfile, HubError> {
        let new = self.policy.validate(new)?;
        let username_lower = new.username.to_lowercase();

        // Cheap early rejection; the entry check below is authoritative.
        if self.usernames.contains_key(&username_lower) {
            return Err(HubError::DuplicateUsername);
        }

        let password_hash = self.hasher.hash(&new.password).await?;
        let id = prefixed_ulid(prefix::USER);

        match self.usernames.entry(username_lower.clone()) {
            Entry::Occupied(_) => return Err(HubError::DuplicateUsername),
            Entry::Vacant(slot) => {
                slot.insert(id.clone());
            }
        }

        let user = User {
            id: id.clone(),
            username: new.username,
            username_lower,
            display_name: new.display_name.unwrap_or_default(),
            email: new.email,
            password_hash,
            is_online: false,
            last_seen: None,
            created_at: Utc::now(),
        };
        self.users.insert(id, user.clone());

        tracing::info!(user_id = %user.id, username = %user.username, "user registered");

        Ok(UserProfile::from(user))
    }

    async fn verify_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<UserProfile, HubError> {
        let username_lower = username.trim().to_lowercase();
        let user = self
            .usernames
            .get(&username_lower)
            .and_then(|id| self.users.get(id.value()).map(|u| u.value().clone()));

        let Some(user) = user else {
            self.hasher.verify_dummy(password).await;
            return Err(HubError::InvalidCredentials);
        };

        if self.hasher.verify(password, &user.password_hash).await? {
            Ok(UserProfile::from(user))
        } else {
            Err(HubError::InvalidCredentials)
        }
    }

    async fn set_online_status(&self, user_id: &str, online: bool) -> Result<(), HubError> {
        let mut user = self
            .users
            .get_mut(user_id)
            .ok_or_else(|| HubError::Internal(format!("unknown user {user_id}")))?;
        user.is_online = online;
        user.last_seen = Some(Utc::now());
        Ok(())
    }
}

pub struct MemoryMessageLog {
    messages: RwLock<Vec<Message>>,
    ids: SnowflakeGenerator,
}

impl MemoryMessageLog {
    pub fn new() -> Self {
        Self {
            messages: RwLock::new(Vec::new()),
            ids: SnowflakeGenerator::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.messages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryMessageLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageLog for MemoryMessageLog {
    async fn append(&self, new: NewMessage) -> Result<Message, HubError> {
        let message = Message {
            id: self.ids.generate(),
            sender_id: new.sender_id,
            sender_username: new.sender_username,
            content: new.content,
            room_id: new.room_id,
            created_at: new.created_at,
            is_deleted: false,
        };
        self.messages.write().push(message.clone());
        Ok(message)
    }

    async fn recent(
        &self,
        room_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>, HubError> {
        Ok(self
            .messages
            .read()
            .iter()
            .rev()
            .filter(|m| m.room_id == room_id)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }
}
