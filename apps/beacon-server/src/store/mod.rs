//! Collaborator contracts the hub consumes: credentials and the message log.
//!
//! Backed by PostgreSQL in production and in-memory maps in tests or when no
//! database is configured.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::error::HubError;
use crate::models::message::{Message, NewMessage};
use crate::models::user::{NewCredentials, UserProfile};

/// Persists user records and password hashes.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Fails with `DuplicateUsername`, `WeakUsername` or `WeakPassword`.
    async fn create_user(&self, new: NewCredentials) -> Result<UserProfile, HubError>;

    /// Fails with `InvalidCredentials` whether the username is unknown or the
    /// password is wrong.
    async fn verify_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<UserProfile, HubError>;

    /// Updates `is_online` and stamps `last_seen`.
    async fn set_online_status(&self, user_id: &str, online: bool) -> Result<(), HubError>;
}

/// Append-only durable store of broadcast messages.
#[async_trait]
pub trait MessageLog: Send + Sync {
    /// Returns the persisted message with its assigned id.
    async fn append(&self, message: NewMessage) -> Result<Message, HubError>;

    /// Newest first.
    async fn recent(&self, room_id: &str, limit: usize, offset: usize)
        -> Result<Vec<Message>, HubError>;
}

/// Minimum lengths enforced on registration.
#[derive(Debug, Clone, Copy)]
pub struct CredentialPolicy {
    pub min_username_length: usize,
    pub min_password_length: usize,
}

impl From<&crate::config::Config> for CredentialPolicy {
    fn from(config: &crate::config::Config) -> Self {
        Self {
            min_username_length: config.min_username_length,
            min_password_length: config.min_password_length,
        }
    }
}

impl CredentialPolicy {
    /// Trims the username and display name, applies length rules and fills in
    /// the display name default.
    pub fn validate(&self, new: NewCredentials) -> Result<NewCredentials, HubError> {
        let username = new.username.trim().to_string();
        if username.chars().count() < self.min_username_length {
            return Err(HubError::WeakUsername {
                min: self.min_username_length,
            });
        }
        if new.password.chars().count() < self.min_password_length {
            return Err(HubError::WeakPassword {
                min: self.min_password_length,
            });
        }

        let display_name = new
            .display_name
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| username.clone());
        let email = new
            .email
            .map(|e| e.trim().to_lowercase())
            .filter(|e| !e.is_empty());

        Ok(NewCredentials {
            username,
            password: new.password,
            email,
            display_name: Some(display_name),
        })
    }
}
