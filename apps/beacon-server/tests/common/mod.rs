#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;

use beacon_server::auth::password::CredentialHasher;
use beacon_server::config::Config;
use beacon_server::error::HubError;
use beacon_server::gateway::events::ServerMessage;
use beacon_server::gateway::registry::{Connection, OutboundReceiver};
use beacon_server::gateway::Hub;
use beacon_server::models::message::{Message, NewMessage};
use beacon_server::store::memory::{MemoryCredentialStore, MemoryMessageLog};
use beacon_server::store::{CredentialPolicy, MessageLog};
use beacon_server::AppState;

pub const TEST_SECRET: &str = "beacon-test-secret";
pub const PASSWORD: &str = "hunter22";

pub fn test_config() -> Config {
    Config::in_memory(TEST_SECRET)
}

/// Hub state on in-memory stores with cheap Argon2 parameters.
pub struct TestHub {
    pub state: AppState,
    pub credentials: Arc<MemoryCredentialStore>,
}

impl TestHub {
    pub fn hub(&self) -> &Hub {
        &self.state.hub
    }

    /// Accept a connection and consume its `auth_required` greeting.
    pub fn connect(&self) -> Peer {
        let (conn, rx) = self.hub().connect().unwrap();
        let mut peer = Peer { conn, rx };
        assert_eq!(peer.next().kind(), "auth_required");
        peer
    }
}

pub fn test_hub() -> TestHub {
    test_hub_with_log(Arc::new(MemoryMessageLog::new()))
}

pub fn test_hub_with_log(messages: Arc<dyn MessageLog>) -> TestHub {
    let config = test_config();
    let credentials = Arc::new(MemoryCredentialStore::new(
        CredentialHasher::with_cost(8, 1).unwrap(),
        CredentialPolicy::from(&config),
    ));
    let state = AppState::with_collaborators(config, credentials.clone(), messages);
    TestHub { state, credentials }
}

pub fn test_app() -> (Router, TestHub) {
    test_app_with_log(Arc::new(MemoryMessageLog::new()))
}

pub fn test_app_with_log(messages: Arc<dyn MessageLog>) -> (Router, TestHub) {
    let hub = test_hub_with_log(messages);
    let app = beacon_server::routes::router().with_state(hub.state.clone());
    (app, hub)
}

/// A connection as the hub sees it, plus the frames queued for it.
pub struct Peer {
    pub conn: Arc<Connection>,
    pub rx: OutboundReceiver,
}

impl Peer {
    pub fn id(&self) -> &str {
        self.conn.id()
    }

    /// Next queued frame. Panics if nothing is queued.
    pub fn next(&mut self) -> Arc<ServerMessage> {
        self.rx.try_recv().expect("expected a queued frame")
    }

    pub fn drain(&mut self) -> Vec<Arc<ServerMessage>> {
        let mut frames = Vec::new();
        while let Ok(msg) = self.rx.try_recv() {
            frames.push(msg);
        }
        frames
    }

    pub fn drain_kinds(&mut self) -> Vec<&'static str> {
        self.drain().iter().map(|m| m.kind()).collect()
    }

    pub async fn send(&self, hub: &Hub, json: serde_json::Value) -> Result<(), HubError> {
        hub.handle_text(&self.conn, &json.to_string()).await
    }
}

pub async fn register(hub: &Hub, peer: &mut Peer, username: &str) -> String {
    peer.send(
        hub,
        serde_json::json!({"type": "register", "username": username, "password": PASSWORD}),
    )
    .await
    .unwrap();
    let user = peer.conn.user().expect("registered connection is authenticated");
    peer.drain();
    user.user_id
}

/// Message log whose every call fails.
pub struct BrokenLog;

#[async_trait]
impl MessageLog for BrokenLog {
    async fn append(&self, _message: NewMessage) -> Result<Message, HubError> {
        Err(HubError::PersistenceFailure("disk on fire".into()))
    }

    async fn recent(
        &self,
        _room_id: &str,
        _limit: usize,
        _offset: usize,
    ) -> Result<Vec<Message>, HubError> {
        Err(HubError::Internal("read failed".into()))
    }
}
