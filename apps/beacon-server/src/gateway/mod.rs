//! The real-time hub: connection lifecycle, command routing and fan-out.

pub mod events;
pub mod fanout;
pub mod handler;
pub mod registry;
pub mod server;
pub mod session;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use beacon_common::id::{prefix, prefixed_ulid};

use crate::auth::tokens::TokenService;
use crate::config::Config;
use crate::error::HubError;
use crate::models::user::UserProfile;
use crate::store::{CredentialStore, MessageLog};

use events::ServerMessage;
use fanout::BroadcastEngine;
use registry::{Connection, ConnectionRegistry, OutboundReceiver};

/// Outcome of a non-critical side effect such as a presence update.
///
/// Callers log it; it never becomes the result of the operation that
/// triggered it.
#[must_use]
#[derive(Debug)]
pub enum SideEffect {
    Applied,
    Skipped,
    Failed(HubError),
}

impl SideEffect {
    pub fn log(self, what: &'static str, connection_id: &str) {
        match self {
            SideEffect::Applied => tracing::trace!(connection_id, what, "side effect applied"),
            SideEffect::Skipped => tracing::trace!(connection_id, what, "side effect skipped"),
            SideEffect::Failed(err) => {
                tracing::warn!(connection_id, what, %err, "side effect failed")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct HubSettings {
    /// Messages sent privately right after authentication.
    pub history_limit: usize,
    pub outbound_buffer: usize,
    pub default_room: String,
}

impl From<&Config> for HubSettings {
    fn from(config: &Config) -> Self {
        Self {
            history_limit: config.history_limit,
            outbound_buffer: config.outbound_buffer.max(1),
            default_room: config.default_room.clone(),
        }
    }
}

/// Owns the connection registry and the collaborators every handler needs.
/// Constructed once per process (or per test) and shared behind an `Arc`.
pub struct Hub {
    registry: Arc<ConnectionRegistry>,
    fanout: BroadcastEngine,
    credentials: Arc<dyn CredentialStore>,
    tokens: Arc<dyn TokenService>,
    messages: Arc<dyn MessageLog>,
    settings: HubSettings,
    shutting_down: AtomicBool,
}

impl Hub {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        tokens: Arc<dyn TokenService>,
        messages: Arc<dyn MessageLog>,
        settings: HubSettings,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        Self {
            fanout: BroadcastEngine::new(registry.clone()),
            registry,
            credentials,
            tokens,
            messages,
            settings,
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Accept a new connection: register it `Unauthenticated` and queue the
    /// `auth_required` greeting. The receiver feeds the transport's writer.
    /// Refused with `ConnectionClosed` once `shutdown` has begun.
    pub fn connect(&self) -> Result<(Arc<Connection>, OutboundReceiver), HubError> {
        if self.is_shutting_down() {
            return Err(HubError::ConnectionClosed);
        }
        let (tx, rx) = mpsc::channel(self.settings.outbound_buffer);
        let conn = Arc::new(Connection::new(
            prefixed_ulid(prefix::CONNECTION),
            self.registry.next_accept_seq(),
            tx,
        ));
        self.registry.register(conn.clone())?;
        // Shutdown may have taken its snapshot between the check and the insert.
        if self.is_shutting_down() {
            self.registry.unregister(conn.id());
            conn.close();
            return Err(HubError::ConnectionClosed);
        }
        conn.send(ServerMessage::auth_required())?;

        tracing::info!(connection_id = %conn.id(), live = self.registry.len(), "connection accepted");
        Ok((conn, rx))
    }

    /// Tear down a connection after its transport closed. Safe to call more
    /// than once; only the first call has any effect.
    pub async fn disconnect(&self, connection_id: &str) {
        let Some(conn) = self.registry.unregister(connection_id) else {
            return;
        };
        let previous = conn.close();

        tracing::info!(
            connection_id,
            user_id = previous.as_ref().map(|u| u.user_id.as_str()),
            live = self.registry.len(),
            "connection closed"
        );

        if let Some(user) = previous {
            self.mark_offline(&user, connection_id)
                .await
                .log("presence offline", connection_id);
            self.fanout.broadcast_to_all(ServerMessage::system(format!(
                "{} left the chat",
                user.display_name
            )));
        }
    }

    /// Process shutdown: new connections are refused, every bound user goes
    /// offline, every connection is told and closed. The caller releases the
    /// listener afterwards.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let connections = self.registry.snapshot();
        tracing::info!(live = connections.len(), "hub shutting down");

        let mut seen = HashSet::new();
        for conn in &connections {
            if let Some(user) = conn.user() {
                if seen.insert(user.user_id.clone()) {
                    self.set_presence(&user.user_id, false)
                        .await
                        .log("presence offline", conn.id());
                }
            }
        }

        for conn in connections {
            if let Err(err) = conn.send(ServerMessage::system("Server is shutting down")) {
                tracing::debug!(connection_id = %conn.id(), %err, "shutdown notice dropped");
            }
            conn.close();
            self.registry.unregister(conn.id());
        }
    }

    /// Offline only once the user's last live session is gone.
    async fn mark_offline(&self, user: &UserProfile, connection_id: &str) -> SideEffect {
        if self.registry.has_other_session(&user.user_id, connection_id) {
            return SideEffect::Skipped;
        }
        self.set_presence(&user.user_id, false).await
    }

    async fn set_presence(&self, user_id: &str, online: bool) -> SideEffect {
        match self.credentials.set_online_status(user_id, online).await {
            Ok(()) => SideEffect::Applied,
            Err(err) => SideEffect::Failed(err),
        }
    }
}
