//! Broadcast engine: delivers one event to every eligible live connection.
//!
//! Each pass takes a registry snapshot and pushes into every recipient's
//! bounded outbound queue with `try_send`, so a slow or dead peer loses the
//! event instead of holding up the rest. Passes are serialized by a
//! sequencer lock; since no pass ever waits on I/O, this keeps every
//! recipient's queue in the same relative order without blocking
//! connects or disconnects.

use std::sync::Arc;

use parking_lot::Mutex;

use super::events::ServerMessage;
use super::registry::ConnectionRegistry;

/// Outcome of one fan-out pass, as seen by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub failed: usize,
}

pub struct BroadcastEngine {
    registry: Arc<ConnectionRegistry>,
    sequencer: Mutex<()>,
}

impl BroadcastEngine {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            sequencer: Mutex::new(()),
        }
    }

    /// Deliver to every authenticated connection except the sender.
    pub fn broadcast_to_others(&self, sender_connection_id: &str, msg: ServerMessage) -> Delivery {
        self.fan_out(Some(sender_connection_id), msg)
    }

    /// Deliver to every authenticated connection.
    pub fn broadcast_to_all(&self, msg: ServerMessage) -> Delivery {
        self.fan_out(None, msg)
    }

    fn fan_out(&self, excluded: Option<&str>, msg: ServerMessage) -> Delivery {
        let kind = msg.kind();
        let payload = Arc::new(msg);
        let mut delivery = Delivery::default();

        let _turn = self.sequencer.lock();
        for conn in self.registry.snapshot() {
            if excluded == Some(conn.id()) {
                continue;
            }
            match conn.deliver_if_authenticated(payload.clone()) {
                Ok(true) => delivery.delivered += 1,
                Ok(false) => {}
                Err(err) => {
                    delivery.failed += 1;
                    tracing::warn!(connection_id = %conn.id(), %err, kind, "fan-out delivery failed");
                }
            }
        }

        tracing::debug!(
            kind,
            delivered = delivery.delivered,
            failed = delivery.failed,
            "fan-out complete"
        );
        delivery
    }
}
