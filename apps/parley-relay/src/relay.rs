use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Fan-out state: every connected signaling peer and the channel used to push
/// frames back to it. The relay keeps no per-session state and never parses
/// an envelope beyond logging its kind.
#[derive(Clone)]
pub struct RelayState {
    peers: Arc<DashMap<String, mpsc::UnboundedSender<String>>>,
}

impl RelayState {
    pub fn new() -> Self {
        Self {
            peers: Arc::new(DashMap::new()),
        }
    }

    fn add_peer(&self, peer_id: String, tx: mpsc::UnboundedSender<String>) {
        self.peers.insert(peer_id, tx);
    }

    fn remove_peer(&self, peer_id: &str) {
        self.peers.remove(peer_id);
    }

    /// Rebroadcast a frame to every peer except the sender.
    fn broadcast_except(&self, sender_id: &str, frame: &str) {
        for peer in self.peers.iter() {
            if peer.key() != sender_id {
                let _ = peer.value().send(frame.to_string());
            }
        }
    }
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

/// Best-effort classification of a signaling frame, for logging only.
fn envelope_kind(frame: &str) -> &'static str {
    match serde_json::from_str::<serde_json::Value>(frame) {
        Ok(value) if value.get("offer").is_some() => "offer",
        Ok(value) if value.get("answer").is_some() => "answer",
        Ok(value) if value.get("candidate").is_some() => "candidate",
        Ok(_) => "unrecognized",
        Err(_) => "malformed",
    }
}

pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: RelayState) {
    let peer_id = Uuid::new_v4().to_string();
    let (mut sender, mut receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    state.add_peer(peer_id.clone(), tx);
    info!(peer = %peer_id, "signaling peer connected");

    // Forward broadcast frames from the channel to this peer's socket.
    let forward_peer_id = peer_id.clone();
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sender.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
        debug!(peer = %forward_peer_id, "relay forwarder task ended");
    });

    while let Some(msg_result) = receiver.next().await {
        let msg = match msg_result {
            Ok(m) => m,
            Err(e) => {
                error!(peer = %peer_id, error = %e, "websocket error");
                break;
            }
        };

        match msg {
            Message::Text(frame) => {
                let kind = envelope_kind(&frame);
                if kind == "malformed" {
                    warn!(peer = %peer_id, "dropping malformed signaling frame");
                    continue;
                }
                debug!(peer = %peer_id, kind, "rebroadcasting signaling envelope");
                state.broadcast_except(&peer_id, &frame);
            }
            Message::Close(_) => {
                debug!(peer = %peer_id, "received close frame");
                break;
            }
            // Ping/Pong are handled by axum; binary frames are not part of
            // the signaling contract.
            _ => {}
        }
    }

    state.remove_peer(&peer_id);
    info!(peer = %peer_id, "signaling peer disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_envelope_kinds() {
        assert_eq!(envelope_kind(r#"{"offer":{"type":"offer","sdp":"v=0"}}"#), "offer");
        assert_eq!(envelope_kind(r#"{"answer":{"type":"answer","sdp":"v=0"}}"#), "answer");
        assert_eq!(envelope_kind(r#"{"candidate":{"candidate":"c"}}"#), "candidate");
        assert_eq!(envelope_kind(r#"{"something":1}"#), "unrecognized");
        assert_eq!(envelope_kind("not json"), "malformed");
    }

    #[tokio::test]
    async fn broadcast_skips_the_sender() {
        let state = RelayState::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        state.add_peer("a".into(), tx_a);
        state.add_peer("b".into(), tx_b);

        state.broadcast_except("a", r#"{"offer":{}}"#);

        assert_eq!(rx_b.recv().await.as_deref(), Some(r#"{"offer":{}}"#));
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn removed_peer_no_longer_receives() {
        let state = RelayState::new();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        state.add_peer("a".into(), tx_a);
        state.add_peer("b".into(), tx_b);
        state.remove_peer("b");

        state.broadcast_except("a", r#"{"candidate":{}}"#);
        assert!(rx_b.try_recv().is_err());
    }
}
