//! PostgreSQL-backed collaborators (diesel-async over a deadpool pool).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, OptionalExtension};
use diesel_async::RunQueryDsl;

use beacon_common::id::{prefix, prefixed_ulid};
use beacon_common::SnowflakeGenerator;

use super::{CredentialPolicy, CredentialStore, MessageLog};
use crate::auth::password::CredentialHasher;
use crate::db::pool::DbPool;
use crate::db::schema::{messages, users};
use crate::error::HubError;
use crate::models::message::{Message, MessageRow, NewMessage};
use crate::models::user::{NewCredentials, NewUser, User, UserProfile};

pub struct PgCredentialStore {
    db: DbPool,
    hasher: CredentialHasher,
    policy: CredentialPolicy,
}

impl PgCredentialStore {
    pub fn new(db: DbPool, hasher: CredentialHasher, policy: CredentialPolicy) -> Self {
        Self { db, hasher, policy }
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn create_user(&self, new: NewCredentials) -> Result<UserProfile, HubError> {
        let new = self.policy.validate(new)?;
        let password_hash = self.hasher.hash(&new.password).await?;
        let id = prefixed_ulid(prefix::USER);
        let username_lower = new.username.to_lowercase();

        let mut conn = self.db.get().await?;

        let user: User = diesel::insert_into(users::table)
            .values(NewUser {
                id: &id,
                username: &new.username,
                username_lower: &username_lower,
                display_name: new.display_name.as_deref().unwrap_or(&new.username),
                email: new.email.as_deref(),
                password_hash: &password_hash,
            })
            .returning(User::as_returning())
            .get_result(&mut conn)
            .await
            .map_err(|e| match e {
                diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
                    HubError::DuplicateUsername
                }
                other => HubError::from(other),
            })?;

        tracing::info!(user_id = %user.id, username = %user.username, "user registered");

        Ok(UserProfile::from(user))
    }

    async fn verify_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<UserProfile, HubError> {
        let username_lower = username.trim().to_lowercase();
        let mut conn = self.db.get().await?;

        let user: Option<User> = users::table
            .filter(users::username_lower.eq(&username_lower))
            .select(User::as_select())
            .first(&mut conn)
            .await
            .optional()?;

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
        let mut conn = self.db.get().await?;
        diesel::update(users::table.find(user_id))
            .set((users::is_online.eq(online), users::last_seen.eq(Some(Utc::now()))))
            .execute(&mut conn)
            .await?;
        Ok(())
    }
}

pub struct PgMessageLog {
    db: DbPool,
    ids: Arc<SnowflakeGenerator>,
}

impl PgMessageLog {
    pub fn new(db: DbPool, ids: Arc<SnowflakeGenerator>) -> Self {
        Self { db, ids }
    }
}

#[async_trait]
impl MessageLog for PgMessageLog {
    async fn append(&self, new: NewMessage) -> Result<Message, HubError> {
        let mut conn = self.db.get().await?;

        let message: Message = diesel::insert_into(messages::table)
            .values(MessageRow {
                id: self.ids.generate(),
                sender_id: &new.sender_id,
                sender_username: &new.sender_username,
                content: &new.content,
                room_id: &new.room_id,
                created_at: new.created_at,
                is_deleted: false,
            })
            .returning(Message::as_returning())
            .get_result(&mut conn)
            .await?;

        Ok(message)
    }

    async fn recent(
        &self,
        room_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>, HubError> {
        let mut conn = self.db.get().await?;
        let (limit, offset) = page_bounds(limit, offset);

        let rows: Vec<Message> = messages::table
            .filter(messages::room_id.eq(room_id))
            .order((messages::created_at.desc(), messages::id.desc()))
            .limit(limit)
            .offset(offset)
            .select(Message::as_select())
            .load(&mut conn)
            .await?;

        Ok(rows)
    }
}

/// SQL `LIMIT`/`OFFSET` for a client-supplied page. Values past `i64::MAX`
/// saturate instead of wrapping negative.
fn page_bounds(limit: usize, offset: usize) -> (i64, i64) {
    (
        i64::try_from(limit).unwrap_or(i64::MAX),
        i64::try_from(offset).unwrap_or(i64::MAX),
    )
}
