//! Wire format: inbound commands and outbound frames.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::HubError;
use crate::models::message::Message;
use crate::models::user::UserProfile;

// ---------------------------------------------------------------------------
// Client → Server
// ---------------------------------------------------------------------------

/// A decoded inbound message. Each variant carries only the fields it needs.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Register(RegisterPayload),
    Login(LoginPayload),
    Authenticate(AuthenticatePayload),
    Logout,
    GetHistory(HistoryQuery),
    GetOnlineUsers,
    Broadcast(BroadcastPayload),
}

impl Command {
    /// Wire name of the command, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Register(_) => "register",
            Command::Login(_) => "login",
            Command::Authenticate(_) => "authenticate",
            Command::Logout => "logout",
            Command::GetHistory(_) => "get_history",
            Command::GetOnlineUsers => "get_online_users",
            Command::Broadcast(_) => "broadcast",
        }
    }

    /// Whether the command is rejected with `AuthenticationRequired` outside
    /// the `Authenticated` state. `logout` is a silent no-op instead.
    pub fn requires_authentication(&self) -> bool {
        matches!(
            self,
            Command::GetHistory(_) | Command::GetOnlineUsers | Command::Broadcast(_)
        )
    }

    /// Decode one text frame. Unknown `type` values fail with
    /// `UnknownCommandType`; anything else unreadable with `MalformedMessage`.
    pub fn decode(text: &str) -> Result<Self, HubError> {
        let envelope: Envelope = serde_json::from_str(text)
            .map_err(|e| HubError::MalformedMessage(e.to_string()))?;

        let fields = envelope.fields;
        match envelope.kind.as_str() {
            "register" => Ok(Command::Register(payload(fields)?)),
            "login" => Ok(Command::Login(payload(fields)?)),
            "authenticate" => Ok(Command::Authenticate(payload(fields)?)),
            "logout" => Ok(Command::Logout),
            "get_history" => Ok(Command::GetHistory(payload(fields)?)),
            "get_online_users" => Ok(Command::GetOnlineUsers),
            "broadcast" => Ok(Command::Broadcast(payload(fields)?)),
            other => Err(HubError::UnknownCommandType(other.to_string())),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

fn payload<T: DeserializeOwned>(fields: Map<String, Value>) -> Result<T, HubError> {
    serde_json::from_value(Value::Object(fields))
        .map_err(|e| HubError::MalformedMessage(e.to_string()))
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LoginPayload {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AuthenticatePayload {
    pub token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BroadcastPayload {
    pub content: String,
}

// ---------------------------------------------------------------------------
// Server → Client
// ---------------------------------------------------------------------------

/// One outbound frame: `{type, content, timestamp, ...type-specific fields}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerMessage {
    #[serde(flatten)]
    pub event: ServerEvent,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    AuthRequired,
    AuthSuccess {
        user: UserProfile,
        token: String,
    },
    System,
    #[serde(rename_all = "camelCase")]
    Broadcast {
        user: UserProfile,
        message_id: Option<i64>,
        room_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Confirmation {
        message_id: Option<i64>,
    },
    Error {
        code: String,
    },
    #[serde(rename_all = "camelCase")]
    MessageHistory {
        messages: Vec<Message>,
        room_id: String,
    },
    OnlineUsers {
        users: Vec<UserProfile>,
    },
}

impl ServerMessage {
    fn now(event: ServerEvent, content: impl Into<String>) -> Self {
        Self {
            event,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn auth_required() -> Self {
        Self::now(
            ServerEvent::AuthRequired,
            "Please register or log in to join the conversation",
        )
    }

    pub fn auth_success(user: UserProfile, token: String) -> Self {
        let content = format!("Welcome, {}!", user.display_name);
        Self::now(ServerEvent::AuthSuccess { user, token }, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::now(ServerEvent::System, content)
    }

    /// A chat message relayed to other peers. `timestamp` is the moment the
    /// broadcast was triggered.
    pub fn broadcast(
        user: UserProfile,
        content: String,
        message_id: Option<i64>,
        room_id: String,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event: ServerEvent::Broadcast {
                user,
                message_id,
                room_id,
            },
            content,
            timestamp,
        }
    }

    pub fn confirmation(message_id: Option<i64>) -> Self {
        Self::now(ServerEvent::Confirmation { message_id }, "Message delivered")
    }

    pub fn error(err: &HubError) -> Self {
        Self::now(
            ServerEvent::Error {
                code: err.code().to_string(),
            },
            err.public_message(),
        )
    }

    /// `messages` must already be oldest-first.
    pub fn history(messages: Vec<Message>, room_id: String) -> Self {
        let content = format!("{} message(s) in #{room_id}", messages.len());
        Self::now(ServerEvent::MessageHistory { messages, room_id }, content)
    }

    pub fn online_users(users: Vec<UserProfile>) -> Self {
        let content = format!("{} user(s) online", users.len());
        Self::now(ServerEvent::OnlineUsers { users }, content)
    }

    /// Id of the stored message a relayed broadcast carries.
    pub fn relayed_message_id(&self) -> Option<i64> {
        match self.event {
            ServerEvent::Broadcast { message_id, .. } => message_id,
            _ => None,
        }
    }

    /// Wire name of the frame, for logs and assertions.
    pub fn kind(&self) -> &'static str {
        match self.event {
            ServerEvent::AuthRequired => "auth_required",
            ServerEvent::AuthSuccess { .. } => "auth_success",
            ServerEvent::System => "system",
            ServerEvent::Broadcast { .. } => "broadcast",
            ServerEvent::Confirmation { .. } => "confirmation",
            ServerEvent::Error { .. } => "error",
            ServerEvent::MessageHistory { .. } => "message_history",
            ServerEvent::OnlineUsers { .. } => "online_users",
        }
    }
}
