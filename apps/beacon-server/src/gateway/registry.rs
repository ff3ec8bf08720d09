//! Live connections and their per-connection session state.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use super::events::ServerMessage;
use super::session::SessionState;
use crate::error::HubError;
use crate::models::message::Message;
use crate::models::user::UserProfile;

pub type OutboundSender = mpsc::Sender<Arc<ServerMessage>>;
pub type OutboundReceiver = mpsc::Receiver<Arc<ServerMessage>>;

/// One live transport session.
///
/// The session state sits behind a `parking_lot::Mutex`; every transition and
/// every fan-out delivery takes it, so a connection is never handed an event
/// unless it is `Authenticated` at that instant.
pub struct Connection {
    id: String,
    /// Accept order, used to keep snapshots stable.
    accept_seq: u64,
    state: Mutex<SessionState>,
    seen: Mutex<SeenMessages>,
    outbound: OutboundSender,
    close_signal: watch::Sender<bool>,
}

/// Stored messages that reached this connection through one path (live
/// fan-out or the history sent after authentication), so the other path
/// skips them.
#[derive(Default)]
struct SeenMessages {
    /// Relayed since authentication. `None` once the history frame is queued.
    live: Option<Vec<i64>>,
    /// Carried by the history frame.
    replayed: HashSet<i64>,
}

impl Connection {
    pub fn new(id: String, accept_seq: u64, outbound: OutboundSender) -> Self {
        Self {
            id,
            accept_seq,
            state: Mutex::new(SessionState::Unauthenticated),
            seen: Mutex::new(SeenMessages::default()),
            outbound,
            close_signal: watch::channel(false).0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state.lock().clone()
    }

    pub fn user(&self) -> Option<UserProfile> {
        self.state.lock().user().cloned()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.lock().is_authenticated()
    }

    pub fn require_authenticated(&self) -> Result<UserProfile, HubError> {
        self.state.lock().require_authenticated()
    }

    pub fn ensure_can_authenticate(&self) -> Result<(), HubError> {
        self.state.lock().ensure_can_authenticate()
    }

    /// Moves to `Authenticated` and queues `ack` in the same critical section,
    /// so the acknowledgement precedes any fan-out event on this connection.
    /// Relayed messages are recorded from here until `send_history` or
    /// `skip_history`.
    pub fn authenticate(&self, user: UserProfile, ack: ServerMessage) -> Result<(), HubError> {
        let mut state = self.state.lock();
        state.authenticate(user)?;
        *self.seen.lock() = SeenMessages {
            live: Some(Vec::new()),
            replayed: HashSet::new(),
        };
        if let Err(err) = self.enqueue(Arc::new(ack)) {
            tracing::warn!(connection_id = %self.id, %err, "auth acknowledgement dropped");
        }
        Ok(())
    }

    pub fn logout(&self) -> Option<UserProfile> {
        self.state.lock().logout()
    }

    /// Moves to `Closed` and tells the transport to shut down.
    /// Returns the user that was bound, if any.
    pub fn close(&self) -> Option<UserProfile> {
        let previous = self.state.lock().close();
        self.close_signal.send_replace(true);
        previous
    }

    /// Resolves (via `wait_for`) once the connection has been closed.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.close_signal.subscribe()
    }

    /// Queue a frame for this connection regardless of its state.
    pub fn send(&self, msg: ServerMessage) -> Result<(), HubError> {
        self.enqueue(Arc::new(msg))
    }

    /// Queue the post-authentication history, minus anything already relayed
    /// live. Later relays of the messages it carries are skipped.
    pub fn send_history(&self, mut messages: Vec<Message>, room_id: String) -> Result<(), HubError> {
        let mut seen = self.seen.lock();
        let live = seen.live.take().unwrap_or_default();
        messages.retain(|m| !live.contains(&m.id));
        seen.replayed = messages.iter().map(|m| m.id).collect();
        self.enqueue(Arc::new(ServerMessage::history(messages, room_id)))
    }

    /// Stop recording relayed messages when no history will follow.
    pub fn skip_history(&self) {
        self.seen.lock().live = None;
    }

    /// Fan-out delivery. `Ok(false)` means the connection was skipped: it is
    /// not authenticated, or the message already went out in its history.
    pub fn deliver_if_authenticated(&self, msg: Arc<ServerMessage>) -> Result<bool, HubError> {
        let state = self.state.lock();
        if !state.is_authenticated() {
            return Ok(false);
        }
        let Some(message_id) = msg.relayed_message_id() else {
            return self.enqueue(msg).map(|()| true);
        };

        let mut seen = self.seen.lock();
        if seen.replayed.contains(&message_id) {
            return Ok(false);
        }
        self.enqueue(msg)?;
        if let Some(live) = seen.live.as_mut() {
            live.push(message_id);
        }
        Ok(true)
    }

    fn enqueue(&self, msg: Arc<ServerMessage>) -> Result<(), HubError> {
        self.outbound.try_send(msg).map_err(|e| HubError::DeliveryFailure {
            connection_id: self.id.clone(),
            reason: match e {
                mpsc::error::TrySendError::Full(_) => "outbound queue full",
                mpsc::error::TrySendError::Closed(_) => "transport gone",
            },
        })
    }
}

/// Shared registry of all live connections.
///
/// Uses `DashMap` for shard-level concurrency; a snapshot copies the `Arc`s
/// out so fan-out never holds a shard lock while delivering.
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<Connection>>,
    next_seq: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Accept-order sequence number for the next connection.
    pub fn next_accept_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Add a newly accepted connection. Fails only on an id collision.
    pub fn register(&self, connection: Arc<Connection>) -> Result<(), HubError> {
        match self.connections.entry(connection.id().to_string()) {
            Entry::Occupied(_) => Err(HubError::DuplicateConnection(connection.id().to_string())),
            Entry::Vacant(slot) => {
                slot.insert(connection);
                Ok(())
            }
        }
    }

    /// Idempotent removal. Returns the connection if it was still present.
    pub fn unregister(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.connections.remove(connection_id).map(|(_, conn)| conn)
    }

    /// Point-in-time view in accept order. Later registrations or removals do
    /// not affect the returned sequence.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        let mut connections: Vec<Arc<Connection>> =
            self.connections.iter().map(|c| c.value().clone()).collect();
        connections.sort_by_key(|c| c.accept_seq);
        connections
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn count_authenticated(&self) -> usize {
        self.connections
            .iter()
            .filter(|c| c.value().is_authenticated())
            .count()
    }

    /// Distinct users bound to authenticated connections, in order of each
    /// user's earliest live connection.
    pub fn online_users(&self) -> Vec<UserProfile> {
        let mut seen = HashSet::new();
        self.snapshot()
            .iter()
            .filter_map(|c| c.user())
            .filter(|u| seen.insert(u.user_id.clone()))
            .collect()
    }

    /// Whether `user_id` is bound to any authenticated connection other than `except`.
    pub fn has_other_session(&self, user_id: &str, except: &str) -> bool {
        self.connections.iter().any(|c| {
            c.key() != except && c.value().user().is_some_and(|u| u.user_id == user_id)
        })
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
