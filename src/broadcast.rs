// =============================================================================
// Broadcast fan-out — consumer socket set, per-socket serialized send
// =============================================================================
//
// Generalizes the teacher's `api/ws.rs` per-connection send pattern from
// one connection to a registered set: each socket gets its own single-slot
// send lock so a slow client is serialized against itself, never against
// its peers, and the publisher never waits beyond scheduling the send.
// =============================================================================

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::BroadcastMessage;

type Sink = SplitSink<WebSocket, Message>;

struct ConsumerSocket {
    sink: AsyncMutex<Sink>,
}

/// The set of connected consumer sockets for the live `SpreadEvent` feed.
/// Cloneable: every holder shares the same underlying map.
#[derive(Clone, Default)]
pub struct BroadcastHub {
    sockets: Arc<DashMap<Uuid, Arc<ConsumerSocket>>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sink: Sink) -> Uuid {
        let id = Uuid::new_v4();
        self.sockets.insert(
            id,
            Arc::new(ConsumerSocket {
                sink: AsyncMutex::new(sink),
            }),
        );
        id
    }

    pub fn unregister(&self, id: Uuid) {
        self.sockets.remove(&id);
    }

    pub fn connected_count(&self) -> usize {
        self.sockets.len()
    }

    /// Fan out `message` to every connected socket. Each send runs as its
    /// own task so the slowest socket never gates delivery to the rest;
    /// a socket that errors is removed.
    pub fn publish(&self, message: BroadcastMessage) {
        let Ok(payload) = serde_json::to_string(&message) else {
            warn!("failed to serialize broadcast message");
            return;
        };
        self.publish_json(payload);
    }

    /// Fan out a pre-serialized JSON payload as a single text frame. Used
    /// by consumers whose wire format is not `BroadcastMessage` (e.g. the
    /// chart-frame feed, which sends bare `ChartFrame` objects).
    pub fn publish_json(&self, payload: String) {
        let payload = Arc::new(payload);

        for entry in self.sockets.iter() {
            let id = *entry.key();
            let socket = entry.value().clone();
            let payload = payload.clone();
            let sockets = self.sockets.clone();

            tokio::spawn(async move {
                let mut sink = socket.sink.lock().await;
                if sink.send(Message::Text((*payload).clone())).await.is_err() {
                    drop(sink);
                    debug!(socket = %id, "removing consumer socket after failed send");
                    sockets.remove(&id);
                }
            });
        }
    }

    /// Close every connected socket with a normal-closure status. Called
    /// during graceful shutdown.
    pub async fn close_all(&self) {
        let ids: Vec<Uuid> = self.sockets.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, socket)) = self.sockets.remove(&id) {
                let mut sink = socket.sink.lock().await;
                let _ = sink.send(Message::Close(None)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_hub_has_no_connections() {
        let hub = BroadcastHub::new();
        assert_eq!(hub.connected_count(), 0);
    }

    #[test]
    fn clone_shares_the_same_socket_set() {
        let hub = BroadcastHub::new();
        let hub2 = hub.clone();
        assert_eq!(hub.connected_count(), hub2.connected_count());
    }
}
