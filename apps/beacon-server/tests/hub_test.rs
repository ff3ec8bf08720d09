mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Semaphore;

use beacon_common::id::{has_prefix, prefix};

use beacon_server::error::HubError;
use beacon_server::gateway::events::ServerEvent;
use beacon_server::gateway::session::SessionState;
use beacon_server::models::message::{Message, NewMessage};
use beacon_server::store::memory::MemoryMessageLog;
use beacon_server::store::MessageLog;

use common::{register, BrokenLog, PASSWORD};

// ---------------------------------------------------------------------------
// Registration and login
// ---------------------------------------------------------------------------

#[tokio::test]
async fn distinct_registrations_each_authenticate() {
    let t = common::test_hub();
    let mut peers: Vec<_> = (0..4).map(|_| t.connect()).collect();

    let mut ids = Vec::new();
    for (i, peer) in peers.iter_mut().enumerate() {
        ids.push(register(t.hub(), peer, &format!("user{i}")).await);
    }

    for (peer, id) in peers.iter().zip(&ids) {
        let user = peer.conn.user().unwrap();
        assert_eq!(&user.user_id, id);
        assert!(has_prefix(&user.user_id, prefix::USER));
    }
    assert_eq!(t.hub().registry().count_authenticated(), 4);
    assert_eq!(t.credentials.user_count(), 4);
}

#[tokio::test]
async fn register_replies_with_token_then_private_history() {
    let t = common::test_hub();
    let mut alice = t.connect();

    alice
        .send(
            t.hub(),
            json!({"type": "register", "username": "alice", "password": PASSWORD, "displayName": "Alice"}),
        )
        .await
        .unwrap();

    let ack = alice.next();
    match &ack.event {
        ServerEvent::AuthSuccess { user, token } => {
            assert_eq!(user.username, "alice");
            assert_eq!(user.display_name, "Alice");
            assert!(!token.is_empty());
        }
        other => panic!("expected auth_success, got {other:?}"),
    }
    assert_eq!(alice.next().kind(), "message_history");
    assert!(alice.drain().is_empty());
    assert_eq!(t.credentials.is_online(&alice.conn.user().unwrap().user_id), Some(true));
}

#[tokio::test]
async fn duplicate_username_authenticates_only_once() {
    let t = common::test_hub();
    let mut first = t.connect();
    let mut second = t.connect();

    register(t.hub(), &mut first, "alice").await;
    let err = second
        .send(
            t.hub(),
            json!({"type": "register", "username": "ALICE", "password": PASSWORD}),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, HubError::DuplicateUsername));
    assert_eq!(second.next().kind(), "error");
    assert_eq!(second.conn.state(), SessionState::Unauthenticated);
    assert_eq!(t.hub().registry().count_authenticated(), 1);
}

#[tokio::test]
async fn weak_credentials_are_rejected() {
    let t = common::test_hub();
    let peer = t.connect();

    let err = peer
        .send(t.hub(), json!({"type": "register", "username": "al", "password": PASSWORD}))
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::WeakUsername { min: 3 }));

    let err = peer
        .send(t.hub(), json!({"type": "register", "username": "alice", "password": "123"}))
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::WeakPassword { min: 6 }));
    assert!(!peer.conn.is_authenticated());
}

#[tokio::test]
async fn login_after_register_binds_the_same_user() {
    let t = common::test_hub();
    let mut first = t.connect();
    let registered_id = register(t.hub(), &mut first, "alice").await;

    let mut second = t.connect();
    second
        .send(t.hub(), json!({"type": "login", "username": "alice", "password": PASSWORD}))
        .await
        .unwrap();

    assert_eq!(second.conn.user().unwrap().user_id, registered_id);
    assert_eq!(second.next().kind(), "auth_success");
}

#[tokio::test]
async fn wrong_password_and_unknown_user_look_the_same() {
    let t = common::test_hub();
    let mut alice = t.connect();
    register(t.hub(), &mut alice, "alice").await;

    let peer = t.connect();
    let wrong = peer
        .send(t.hub(), json!({"type": "login", "username": "alice", "password": "nope-nope"}))
        .await
        .unwrap_err();
    let unknown = peer
        .send(t.hub(), json!({"type": "login", "username": "mallory", "password": PASSWORD}))
        .await
        .unwrap_err();

    assert!(matches!(wrong, HubError::InvalidCredentials));
    assert!(matches!(unknown, HubError::InvalidCredentials));
    assert_eq!(wrong.public_message(), unknown.public_message());
}

#[tokio::test]
async fn second_authentication_on_one_connection_is_rejected() {
    let t = common::test_hub();
    let mut alice = t.connect();
    register(t.hub(), &mut alice, "alice").await;

    let err = alice
        .send(t.hub(), json!({"type": "login", "username": "alice", "password": PASSWORD}))
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::AlreadyAuthenticated));

    let err = alice
        .send(t.hub(), json!({"type": "register", "username": "other", "password": PASSWORD}))
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::AlreadyAuthenticated));
    assert_eq!(t.credentials.user_count(), 1);
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[tokio::test]
async fn issued_token_reauthenticates_a_new_connection() {
    let t = common::test_hub();
    let mut alice = t.connect();
    alice
        .send(t.hub(), json!({"type": "register", "username": "alice", "password": PASSWORD}))
        .await
        .unwrap();
    let ack = alice.next();
    let ServerEvent::AuthSuccess { user, token } = &ack.event else {
        panic!("expected auth_success");
    };

    let mut reconnect = t.connect();
    reconnect
        .send(t.hub(), json!({"type": "authenticate", "token": token}))
        .await
        .unwrap();

    assert_eq!(reconnect.conn.user().unwrap().user_id, user.user_id);
    assert_eq!(reconnect.next().kind(), "auth_success");
}

#[tokio::test]
async fn garbage_token_is_invalid() {
    let t = common::test_hub();
    let mut peer = t.connect();

    let err = peer
        .send(t.hub(), json!({"type": "authenticate", "token": "not.a.jwt"}))
        .await
        .unwrap_err();

    assert!(matches!(err, HubError::InvalidToken));
    let reply = peer.next();
    assert!(matches!(&reply.event, ServerEvent::Error { code } if code == "INVALID_TOKEN"));
    assert!(!peer.conn.is_authenticated());
}

// ---------------------------------------------------------------------------
// Broadcast
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unauthenticated_broadcast_reaches_nobody() {
    let t = common::test_hub();
    let anon = t.connect();
    let mut bob = t.connect();
    register(t.hub(), &mut bob, "bob").await;

    let err = anon
        .send(t.hub(), json!({"type": "broadcast", "content": "hello"}))
        .await
        .unwrap_err();

    assert!(matches!(err, HubError::AuthenticationRequired));
    assert!(bob.drain().is_empty());
}

#[tokio::test]
async fn broadcast_reaches_peers_once_and_confirms_to_sender() {
    let t = common::test_hub();
    let mut a = t.connect();
    let mut b = t.connect();
    let mut c = t.connect();
    let a_id = register(t.hub(), &mut a, "alice").await;
    register(t.hub(), &mut b, "bob").await;
    register(t.hub(), &mut c, "carol").await;
    a.drain();
    b.drain();

    a.send(t.hub(), json!({"type": "broadcast", "content": "hello"}))
        .await
        .unwrap();

    let mut confirmed_id = None;
    for peer in [&mut b, &mut c] {
        let frames = peer.drain();
        assert_eq!(frames.len(), 1);
        match &frames[0].event {
            ServerEvent::Broadcast { user, message_id, room_id } => {
                assert_eq!(frames[0].content, "hello");
                assert_eq!(user.user_id, a_id);
                assert_eq!(room_id, "general");
                assert!(message_id.is_some());
                confirmed_id = *message_id;
            }
            other => panic!("expected broadcast, got {other:?}"),
        }
    }

    let own = a.drain();
    assert_eq!(own.len(), 1);
    assert!(matches!(&own[0].event, ServerEvent::Confirmation { message_id } if *message_id == confirmed_id));
}

#[tokio::test]
async fn broadcast_content_is_trimmed() {
    let t = common::test_hub();
    let mut a = t.connect();
    let mut b = t.connect();
    register(t.hub(), &mut a, "alice").await;
    register(t.hub(), &mut b, "bob").await;
    a.drain();

    a.send(t.hub(), json!({"type": "broadcast", "content": "  hi there \n"}))
        .await
        .unwrap();
    assert_eq!(b.next().content, "hi there");
}

#[tokio::test]
async fn empty_broadcast_is_silently_dropped() {
    // Documented quirk: whitespace-only content gets no error and no confirmation.
    let t = common::test_hub();
    let mut a = t.connect();
    let mut b = t.connect();
    register(t.hub(), &mut a, "alice").await;
    register(t.hub(), &mut b, "bob").await;
    a.drain();

    a.send(t.hub(), json!({"type": "broadcast", "content": "   "}))
        .await
        .unwrap();

    assert!(a.drain().is_empty());
    assert!(b.drain().is_empty());

    a.send(t.hub(), json!({"type": "get_history"})).await.unwrap();
    let history = a.next();
    assert!(matches!(&history.event, ServerEvent::MessageHistory { messages, .. } if messages.is_empty()));
}

#[tokio::test]
async fn failed_append_aborts_the_broadcast() {
    let t = common::test_hub_with_log(Arc::new(BrokenLog));
    let mut a = t.connect();
    let mut b = t.connect();
    register(t.hub(), &mut a, "alice").await;
    register(t.hub(), &mut b, "bob").await;
    a.drain();

    let err = a
        .send(t.hub(), json!({"type": "broadcast", "content": "lost"}))
        .await
        .unwrap_err();

    assert!(matches!(err, HubError::PersistenceFailure(_)));
    let frames = a.drain();
    assert_eq!(frames.len(), 1);
    assert!(matches!(&frames[0].event, ServerEvent::Error { code } if code == "PERSISTENCE_FAILURE"));
    assert!(!frames[0].content.contains("disk on fire"));
    assert!(b.drain().is_empty());
}

#[tokio::test]
async fn failed_history_read_is_a_persistence_failure() {
    let t = common::test_hub_with_log(Arc::new(BrokenLog));
    let mut a = t.connect();
    register(t.hub(), &mut a, "alice").await;

    let err = a.send(t.hub(), json!({"type": "get_history"})).await.unwrap_err();
    assert!(matches!(err, HubError::PersistenceFailure(_)));
}

// ---------------------------------------------------------------------------
// Disconnect and presence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn disconnected_peer_is_not_delivered_to() {
    let t = common::test_hub();
    let mut a = t.connect();
    let mut b = t.connect();
    register(t.hub(), &mut a, "alice").await;
    register(t.hub(), &mut b, "bob").await;
    a.drain();
    assert_eq!(t.hub().registry().count_authenticated(), 2);

    t.hub().disconnect(a.id()).await;
    assert_eq!(t.hub().registry().count_authenticated(), 1);
    assert!(a.conn.state().is_closed());

    let leave = b.next();
    assert_eq!(leave.kind(), "system");
    assert!(leave.content.contains("alice"));

    b.send(t.hub(), json!({"type": "broadcast", "content": "anyone?"}))
        .await
        .unwrap();
    assert!(a.drain().is_empty());
}

#[tokio::test]
async fn disconnect_twice_is_harmless() {
    let t = common::test_hub();
    let mut a = t.connect();
    let mut b = t.connect();
    register(t.hub(), &mut a, "alice").await;
    register(t.hub(), &mut b, "bob").await;

    t.hub().disconnect(a.id()).await;
    assert_eq!(t.hub().registry().len(), 1);
    b.drain();

    t.hub().disconnect(a.id()).await;
    assert_eq!(t.hub().registry().len(), 1);
    assert!(b.drain().is_empty());
    assert!(t.hub().registry().unregister(a.id()).is_none());
}

#[tokio::test]
async fn user_stays_online_while_another_session_lives() {
    let t = common::test_hub();
    let mut phone = t.connect();
    let user_id = register(t.hub(), &mut phone, "alice").await;
    let mut laptop = t.connect();
    laptop
        .send(t.hub(), json!({"type": "login", "username": "alice", "password": PASSWORD}))
        .await
        .unwrap();

    t.hub().disconnect(phone.id()).await;
    assert_eq!(t.credentials.is_online(&user_id), Some(true));

    t.hub().disconnect(laptop.id()).await;
    assert_eq!(t.credentials.is_online(&user_id), Some(false));
}

#[tokio::test]
async fn logout_returns_to_unauthenticated_and_notifies_others() {
    let t = common::test_hub();
    let mut a = t.connect();
    let mut b = t.connect();
    let a_id = register(t.hub(), &mut a, "alice").await;
    register(t.hub(), &mut b, "bob").await;
    a.drain();

    a.send(t.hub(), json!({"type": "logout"})).await.unwrap();

    assert_eq!(a.conn.state(), SessionState::Unauthenticated);
    assert_eq!(t.credentials.is_online(&a_id), Some(false));
    assert_eq!(a.drain_kinds(), ["auth_required"]);
    let leave = b.next();
    assert!(leave.content.contains("alice"));

    let err = a
        .send(t.hub(), json!({"type": "broadcast", "content": "still here?"}))
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::AuthenticationRequired));

    a.send(t.hub(), json!({"type": "login", "username": "alice", "password": PASSWORD}))
        .await
        .unwrap();
    assert_eq!(a.conn.user().unwrap().user_id, a_id);
}

#[tokio::test]
async fn logout_without_session_is_silent() {
    let t = common::test_hub();
    let mut anon = t.connect();
    anon.send(t.hub(), json!({"type": "logout"})).await.unwrap();
    assert!(anon.drain().is_empty());
}

#[tokio::test]
async fn join_notice_goes_to_everyone_else() {
    let t = common::test_hub();
    let mut a = t.connect();
    let mut anon = t.connect();
    register(t.hub(), &mut a, "alice").await;

    let mut b = t.connect();
    register(t.hub(), &mut b, "bob").await;

    let frames = a.drain();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].kind(), "system");
    assert!(frames[0].content.contains("bob"));
    assert!(anon.drain().is_empty());
}

#[tokio::test]
async fn online_users_are_distinct_and_ordered() {
    let t = common::test_hub();
    let mut a = t.connect();
    let mut b = t.connect();
    let mut a2 = t.connect();
    register(t.hub(), &mut a, "alice").await;
    register(t.hub(), &mut b, "bob").await;
    a2.send(t.hub(), json!({"type": "login", "username": "alice", "password": PASSWORD}))
        .await
        .unwrap();
    b.drain();

    b.send(t.hub(), json!({"type": "get_online_users"})).await.unwrap();
    let reply = b.next();
    let ServerEvent::OnlineUsers { users } = &reply.event else {
        panic!("expected online_users");
    };
    let names: Vec<&str> = users.iter().map(|u| u.username.as_str()).collect();
    assert_eq!(names, ["alice", "bob"]);
}

#[tokio::test]
async fn shutdown_marks_users_offline_and_closes_everything() {
    let t = common::test_hub();
    let mut a = t.connect();
    let mut anon = t.connect();
    let a_id = register(t.hub(), &mut a, "alice").await;
    let mut closed = a.conn.closed();

    t.hub().shutdown().await;

    assert_eq!(t.credentials.is_online(&a_id), Some(false));
    assert!(t.hub().registry().is_empty());
    assert!(a.conn.state().is_closed());
    assert!(anon.conn.state().is_closed());
    assert_eq!(a.drain_kinds(), ["system"]);
    assert_eq!(anon.drain_kinds(), ["system"]);
    closed.wait_for(|c| *c).await.unwrap();
}

#[tokio::test]
async fn connections_are_refused_once_shutdown_starts() {
    let t = common::test_hub();
    let _a = t.connect();

    t.hub().shutdown().await;

    assert!(t.hub().is_shutting_down());
    assert!(matches!(t.hub().connect(), Err(HubError::ConnectionClosed)));
    assert!(t.hub().registry().is_empty());
}

// ---------------------------------------------------------------------------
// History and routing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn history_returns_prior_broadcasts_oldest_first() {
    let t = common::test_hub();
    let mut a = t.connect();
    let mut b = t.connect();
    let a_id = register(t.hub(), &mut a, "alice").await;
    let b_id = register(t.hub(), &mut b, "bob").await;

    a.send(t.hub(), json!({"type": "broadcast", "content": "one"})).await.unwrap();
    b.send(t.hub(), json!({"type": "broadcast", "content": "two"})).await.unwrap();
    a.send(t.hub(), json!({"type": "broadcast", "content": "three"})).await.unwrap();
    a.drain();

    a.send(t.hub(), json!({"type": "get_history"})).await.unwrap();
    let reply = a.next();
    let ServerEvent::MessageHistory { messages, room_id } = &reply.event else {
        panic!("expected message_history");
    };

    assert_eq!(room_id, "general");
    let got: Vec<(&str, &str)> = messages
        .iter()
        .map(|m| (m.content.as_str(), m.sender_id.as_str()))
        .collect();
    assert_eq!(
        got,
        [("one", a_id.as_str()), ("two", b_id.as_str()), ("three", a_id.as_str())]
    );
}

#[tokio::test]
async fn history_limit_and_offset_page_backwards() {
    let t = common::test_hub();
    let mut a = t.connect();
    register(t.hub(), &mut a, "alice").await;
    for i in 0..5 {
        a.send(t.hub(), json!({"type": "broadcast", "content": format!("m{i}")}))
            .await
            .unwrap();
    }
    a.drain();

    a.send(t.hub(), json!({"type": "get_history", "limit": 2, "offset": 1}))
        .await
        .unwrap();
    let reply = a.next();
    let ServerEvent::MessageHistory { messages, .. } = &reply.event else {
        panic!("expected message_history");
    };
    let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, ["m2", "m3"]);

    a.send(t.hub(), json!({"type": "get_history", "offset": u64::MAX}))
        .await
        .unwrap();
    let reply = a.next();
    let ServerEvent::MessageHistory { messages, .. } = &reply.event else {
        panic!("expected message_history");
    };
    assert!(messages.is_empty());
}

#[tokio::test]
async fn unknown_command_changes_nothing() {
    let t = common::test_hub();
    let mut a = t.connect();
    let mut b = t.connect();
    register(t.hub(), &mut a, "alice").await;
    register(t.hub(), &mut b, "bob").await;
    a.drain();

    let err = a.send(t.hub(), json!({"type": "dance"})).await.unwrap_err();

    assert!(matches!(err, HubError::UnknownCommandType(ref name) if name == "dance"));
    assert!(a.conn.is_authenticated());
    assert_eq!(a.drain_kinds(), ["error"]);
    assert!(b.drain().is_empty());
}

#[tokio::test]
async fn malformed_input_keeps_the_connection_usable() {
    let t = common::test_hub();
    let mut peer = t.connect();

    let err = t.hub().handle_text(&peer.conn, "{not json").await.unwrap_err();
    assert!(matches!(err, HubError::MalformedMessage(_)));
    let reply = peer.next();
    assert!(matches!(&reply.event, ServerEvent::Error { code } if code == "MALFORMED_MESSAGE"));

    register(t.hub(), &mut peer, "alice").await;
    assert!(peer.conn.is_authenticated());
}

#[tokio::test]
async fn authentication_racing_a_disconnect_is_refused() {
    let t = common::test_hub();
    let peer = t.connect();

    t.hub().disconnect(peer.id()).await;
    let err = peer
        .send(t.hub(), json!({"type": "register", "username": "alice", "password": PASSWORD}))
        .await
        .unwrap_err();

    assert!(matches!(err, HubError::ConnectionClosed));
    assert_eq!(t.hub().registry().count_authenticated(), 0);
}

/// Message log whose reads block, once armed, until `open` is called.
struct GatedLog {
    inner: MemoryMessageLog,
    armed: AtomicBool,
    gate: Semaphore,
}

impl GatedLog {
    fn new() -> Self {
        Self {
            inner: MemoryMessageLog::new(),
            armed: AtomicBool::new(false),
            gate: Semaphore::new(0),
        }
    }

    fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    fn open(&self) {
        self.gate.add_permits(1);
    }
}

#[async_trait]
impl MessageLog for GatedLog {
    async fn append(&self, message: NewMessage) -> Result<Message, HubError> {
        self.inner.append(message).await
    }

    async fn recent(
        &self,
        room_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>, HubError> {
        if self.armed.load(Ordering::SeqCst) {
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| HubError::Internal("gate closed".into()))?;
        }
        self.inner.recent(room_id, limit, offset).await
    }
}

#[tokio::test]
async fn history_after_login_skips_broadcasts_already_relayed() {
    let log = Arc::new(GatedLog::new());
    let t = common::test_hub_with_log(log.clone());
    let mut b = t.connect();
    register(t.hub(), &mut b, "bob").await;
    b.send(t.hub(), json!({"type": "broadcast", "content": "before"}))
        .await
        .unwrap();
    b.drain();

    let mut a = t.connect();
    log.arm();
    let hub = t.state.hub.clone();
    let conn = a.conn.clone();
    let joining = tokio::spawn(async move {
        let register = json!({"type": "register", "username": "alice", "password": PASSWORD});
        hub.handle_text(&conn, &register.to_string()).await
    });
    while !a.conn.is_authenticated() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Lands while alice's history read is still pending.
    b.send(t.hub(), json!({"type": "broadcast", "content": "during"}))
        .await
        .unwrap();
    log.open();
    joining.await.unwrap().unwrap();

    let frames = a.drain();
    let kinds: Vec<&str> = frames.iter().map(|f| f.kind()).collect();
    assert_eq!(kinds, ["auth_success", "broadcast", "message_history"]);
    assert_eq!(frames[1].content, "during");
    let ServerEvent::MessageHistory { messages, .. } = &frames[2].event else {
        panic!("expected message_history");
    };
    let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, ["before"]);
}
