//! Command router: one decoded inbound message in, replies and fan-out out.

use chrono::Utc;

use crate::error::HubError;
use crate::models::message::{Message, NewMessage};
use crate::models::user::{NewCredentials, UserProfile};

use super::events::{
    AuthenticatePayload, BroadcastPayload, Command, HistoryQuery, LoginPayload, RegisterPayload,
    ServerMessage,
};
use super::registry::Connection;
use super::Hub;

/// Upper bound on a single `get_history` page.
pub const MAX_HISTORY_PAGE: usize = 100;

impl Hub {
    /// Handle one inbound text frame. Any failure is reported to this
    /// connection as an `error` frame and also returned to the caller.
    pub async fn handle_text(&self, conn: &Connection, text: &str) -> Result<(), HubError> {
        let result = match Command::decode(text) {
            Ok(command) => self.dispatch(conn, command).await,
            Err(err) => Err(err),
        };
        if let Err(err) = &result {
            tracing::debug!(connection_id = %conn.id(), code = err.code(), %err, "command rejected");
            reply(conn, ServerMessage::error(err));
        }
        result
    }

    pub async fn dispatch(&self, conn: &Connection, command: Command) -> Result<(), HubError> {
        tracing::debug!(
            connection_id = %conn.id(),
            command = command.name(),
            state = conn.state().label(),
            "dispatching command"
        );

        if command.requires_authentication() {
            conn.require_authenticated()?;
        }

        match command {
            Command::Register(payload) => self.register(conn, payload).await,
            Command::Login(payload) => self.login(conn, payload).await,
            Command::Authenticate(payload) => self.authenticate(conn, payload).await,
            Command::Logout => self.logout(conn).await,
            Command::GetHistory(query) => self.get_history(conn, query).await,
            Command::GetOnlineUsers => self.get_online_users(conn),
            Command::Broadcast(payload) => self.broadcast(conn, payload).await,
        }
    }

    async fn register(&self, conn: &Connection, payload: RegisterPayload) -> Result<(), HubError> {
        conn.ensure_can_authenticate()?;
        let user = self
            .credentials
            .create_user(NewCredentials {
                username: payload.username,
                password: payload.password,
                email: payload.email,
                display_name: payload.display_name,
            })
            .await?;
        self.complete_authentication(conn, user).await
    }

    async fn login(&self, conn: &Connection, payload: LoginPayload) -> Result<(), HubError> {
        conn.ensure_can_authenticate()?;
        let user = self
            .credentials
            .verify_credentials(&payload.username, &payload.password)
            .await?;
        self.complete_authentication(conn, user).await
    }

    async fn authenticate(
        &self,
        conn: &Connection,
        payload: AuthenticatePayload,
    ) -> Result<(), HubError> {
        conn.ensure_can_authenticate()?;
        let user = self.tokens.validate(&payload.token).await?;
        self.complete_authentication(conn, user).await
    }

    /// Shared tail of every successful authentication: token, state
    /// transition, presence, private history, join notice.
    async fn complete_authentication(
        &self,
        conn: &Connection,
        user: UserProfile,
    ) -> Result<(), HubError> {
        let token = self.tokens.issue(&user).await?;

        // Fails with ConnectionClosed if the transport went away meanwhile.
        conn.authenticate(user.clone(), ServerMessage::auth_success(user.clone(), token))?;
        tracing::info!(connection_id = %conn.id(), user_id = %user.user_id, username = %user.username, "connection authenticated");

        self.set_presence(&user.user_id, true)
            .await
            .log("presence online", conn.id());

        // Broadcasts relayed live since the transition are left out of the
        // history, and the history's messages are not relayed again.
        let history = if self.settings.history_limit > 0 {
            let room = self.settings.default_room.clone();
            match self.load_history(&room, self.settings.history_limit, 0).await {
                Ok(messages) => Some((messages, room)),
                Err(err) => {
                    tracing::warn!(connection_id = %conn.id(), %err, "initial history unavailable");
                    None
                }
            }
        } else {
            None
        };
        match history {
            Some((messages, room)) => {
                if let Err(err) = conn.send_history(messages, room) {
                    tracing::warn!(connection_id = %conn.id(), %err, "initial history dropped");
                }
            }
            None => conn.skip_history(),
        }

        self.fanout.broadcast_to_others(
            conn.id(),
            ServerMessage::system(format!("{} joined the chat", user.display_name)),
        );
        Ok(())
    }

    async fn logout(&self, conn: &Connection) -> Result<(), HubError> {
        let Some(user) = conn.logout() else {
            tracing::debug!(connection_id = %conn.id(), "logout without a session ignored");
            return Ok(());
        };
        tracing::info!(connection_id = %conn.id(), user_id = %user.user_id, "connection logged out");

        self.mark_offline(&user, conn.id())
            .await
            .log("presence offline", conn.id());
        self.fanout.broadcast_to_others(
            conn.id(),
            ServerMessage::system(format!("{} left the chat", user.display_name)),
        );
        reply(conn, ServerMessage::auth_required());
        Ok(())
    }

    async fn get_history(&self, conn: &Connection, query: HistoryQuery) -> Result<(), HubError> {
        let room = query
            .room_id
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| self.settings.default_room.clone());
        let limit = query
            .limit
            .unwrap_or(self.settings.history_limit)
            .clamp(1, MAX_HISTORY_PAGE);
        let offset = query.offset.unwrap_or(0);

        let messages = self.load_history(&room, limit, offset).await?;
        reply(conn, ServerMessage::history(messages, room));
        Ok(())
    }

    fn get_online_users(&self, conn: &Connection) -> Result<(), HubError> {
        reply(conn, ServerMessage::online_users(self.registry.online_users()));
        Ok(())
    }

    async fn broadcast(&self, conn: &Connection, payload: BroadcastPayload) -> Result<(), HubError> {
        let sender = conn.require_authenticated()?;

        let content = payload.content.trim();
        if content.is_empty() {
            // Dropped without a reply; clients rely on this.
            tracing::debug!(connection_id = %conn.id(), "empty broadcast dropped");
            return Ok(());
        }

        let timestamp = Utc::now();
        let stored = self
            .messages
            .append(NewMessage {
                sender_id: sender.user_id.clone(),
                sender_username: sender.username.clone(),
                content: content.to_string(),
                room_id: self.settings.default_room.clone(),
                created_at: timestamp,
            })
            .await
            .map_err(as_persistence)?;

        let delivery = self.fanout.broadcast_to_others(
            conn.id(),
            ServerMessage::broadcast(
                sender,
                stored.content,
                Some(stored.id),
                stored.room_id,
                timestamp,
            ),
        );
        tracing::debug!(
            connection_id = %conn.id(),
            message_id = stored.id,
            delivered = delivery.delivered,
            failed = delivery.failed,
            "broadcast relayed"
        );

        reply(conn, ServerMessage::confirmation(Some(stored.id)));
        Ok(())
    }

    /// Oldest first.
    async fn load_history(
        &self,
        room_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>, HubError> {
        let mut messages = self
            .messages
            .recent(room_id, limit, offset)
            .await
            .map_err(as_persistence)?;
        messages.reverse();
        Ok(messages)
    }
}

/// Direct reply to the acting connection. A full or closed queue is logged,
/// never turned into a second error frame.
fn reply(conn: &Connection, msg: ServerMessage) {
    if let Err(err) = conn.send(msg) {
        tracing::warn!(connection_id = %conn.id(), %err, "reply dropped");
    }
}

fn as_persistence(err: HubError) -> HubError {
    match err {
        HubError::PersistenceFailure(_) => err,
        other => HubError::PersistenceFailure(other.to_string()),
    }
}
