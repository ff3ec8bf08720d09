//! WebSocket upgrade handler and per-connection reader/writer tasks.

use std::collections::VecDeque;
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::watch;

use crate::AppState;

use super::events::ServerMessage;
use super::registry::{Connection, OutboundReceiver};
use super::Hub;

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(ws_upgrade))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state.hub))
}

async fn handle_connection(socket: WebSocket, hub: Arc<Hub>) {
    let (conn, outbound) = match hub.connect() {
        Ok(accepted) => accepted,
        Err(err) => {
            tracing::error!(%err, "failed to accept connection");
            return;
        }
    };

    let (ws_tx, ws_rx) = socket.split();
    let writer = tokio::spawn(write_loop(ws_tx, outbound, conn.closed(), conn.id().to_string()));

    read_loop(&hub, &conn, ws_rx).await;
    hub.disconnect(conn.id()).await;

    if let Err(err) = writer.await {
        tracing::warn!(connection_id = %conn.id(), %err, "writer task failed");
    }
}

/// Frames read while a command is still running, waiting their turn.
const PENDING_FRAMES: usize = 32;

/// Runs commands one at a time, so every transition of this connection is
/// serialized. The transport is still watched while a command is in flight:
/// a peer that goes away is disconnected at once and the command finishes
/// against a closed session. Returns when the peer goes away or the hub
/// closes the session.
async fn read_loop(hub: &Hub, conn: &Connection, mut ws_rx: SplitStream<WebSocket>) {
    let mut closed = conn.closed();
    let mut pending: VecDeque<Utf8Bytes> = VecDeque::new();

    loop {
        if *closed.borrow() {
            break;
        }
        let text = match pending.pop_front() {
            Some(text) => text,
            None => tokio::select! {
                frame = next_text(&mut ws_rx, conn.id()) => match frame {
                    Some(text) => text,
                    None => break,
                },
                _ = wait_closed(&mut closed) => break,
            },
        };

        // Errors were already reported to the peer.
        let handling = hub.handle_text(conn, text.as_str());
        tokio::pin!(handling);
        loop {
            tokio::select! {
                biased;
                _ = &mut handling => break,
                frame = next_text(&mut ws_rx, conn.id()), if pending.len() < PENDING_FRAMES => {
                    match frame {
                        Some(text) => pending.push_back(text),
                        None => {
                            tracing::debug!(connection_id = %conn.id(), "transport closed mid-command");
                            hub.disconnect(conn.id()).await;
                            let _ = handling.await;
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Next text frame, or `None` once the peer is gone. Other frames are skipped.
async fn next_text(ws_rx: &mut SplitStream<WebSocket>, connection_id: &str) -> Option<Utf8Bytes> {
    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => return Some(text),
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(connection_id, ?e, "ws read error");
                return None;
            }
        }
    }
    None
}

/// Resolves once the hub closes the session. The borrow returned by
/// `wait_for` is not `Send`, so it is dropped here rather than in a
/// `select!` arm.
async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|c| *c).await;
}

/// Drains the outbound queue into the socket. On hub-initiated close it
/// flushes what is already queued and sends a close frame.
async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound: OutboundReceiver,
    mut closed: watch::Receiver<bool>,
    connection_id: String,
) {
    loop {
        tokio::select! {
            biased;
            msg = outbound.recv() => match msg {
                Some(msg) => {
                    if send_frame(&mut ws_tx, &msg).await.is_err() {
                        tracing::debug!(%connection_id, "ws write failed");
                        return;
                    }
                }
                None => break,
            },
            _ = wait_closed(&mut closed) => {
                while let Ok(msg) = outbound.try_recv() {
                    if send_frame(&mut ws_tx, &msg).await.is_err() {
                        return;
                    }
                }
                break;
            }
        }
    }

    let close = Message::Close(Some(CloseFrame {
        code: close_code::NORMAL,
        reason: "closing".into(),
    }));
    let _ = ws_tx.send(close).await;
}

async fn send_frame(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> Result<(), axum::Error> {
    let json = match serde_json::to_string(msg) {
        Ok(json) => json,
        Err(err) => {
            tracing::error!(%err, kind = msg.kind(), "failed to encode outbound frame");
            return Ok(());
        }
    };
    ws_tx.send(Message::Text(json.into())).await
}
