//! WebSocket signaling client.
//!
//! The relay is a dumb fan-out: every JSON text frame we send arrives at the
//! other peer verbatim, and vice versa. One envelope carries exactly one of
//! an offer, an answer, or an ICE candidate.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SignalEnvelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offer: Option<RTCSessionDescription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<RTCSessionDescription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<RTCIceCandidateInit>,
}

impl SignalEnvelope {
    pub fn offer(description: RTCSessionDescription) -> Self {
        Self {
            offer: Some(description),
            ..Default::default()
        }
    }

    pub fn answer(description: RTCSessionDescription) -> Self {
        Self {
            answer: Some(description),
            ..Default::default()
        }
    }

    pub fn candidate(candidate: RTCIceCandidateInit) -> Self {
        Self {
            candidate: Some(candidate),
            ..Default::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("failed to connect to relay: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("relay connection closed")]
    Closed,
}

/// Cloneable write half, usable from inside connection callbacks.
#[derive(Clone)]
pub struct SignalSender(mpsc::UnboundedSender<SignalEnvelope>);

impl SignalSender {
    pub fn send(&self, envelope: SignalEnvelope) -> Result<(), SignalingError> {
        self.0.send(envelope).map_err(|_| SignalingError::Closed)
    }
}

/// Handle to the relay connection. Reading and writing run in their own
/// tasks; both shut down when either side of the socket goes away.
pub struct SignalingClient {
    outbox: mpsc::UnboundedSender<SignalEnvelope>,
    inbox: mpsc::UnboundedReceiver<SignalEnvelope>,
}

impl SignalingClient {
    pub async fn connect(ws_url: &str) -> Result<Self, SignalingError> {
        let (stream, _response) = connect_async(ws_url).await?;
        let (mut writer, mut reader) = stream.split();

        let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<SignalEnvelope>();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel::<SignalEnvelope>();

        tokio::spawn(async move {
            while let Some(envelope) = outbox_rx.recv().await {
                let text = match serde_json::to_string(&envelope) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, "failed to encode signal envelope");
                        continue;
                    }
                };
                if writer.send(Message::Text(text)).await.is_err() {
                    debug!("relay writer closed");
                    break;
                }
            }
        });

        tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match serde_json::from_str::<SignalEnvelope>(&text) {
                    Ok(envelope) => {
                        if inbox_tx.send(envelope).is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(error = %err, "dropping malformed signal frame"),
                }
            }
            debug!("relay reader closed");
        });

        Ok(Self {
            outbox: outbox_tx,
            inbox: inbox_rx,
        })
    }

    pub fn send(&self, envelope: SignalEnvelope) -> Result<(), SignalingError> {
        self.outbox
            .send(envelope)
            .map_err(|_| SignalingError::Closed)
    }

    pub async fn recv(&mut self) -> Option<SignalEnvelope> {
        self.inbox.recv().await
    }

    /// Splits into a cloneable sender and the inbound stream. The link
    /// driver consumes the stream; callbacks hold sender clones.
    pub fn split(self) -> (SignalSender, mpsc::UnboundedReceiver<SignalEnvelope>) {
        (SignalSender(self.outbox), self.inbox)
    }
}

/// In-memory signaling pair for exercising the link without a relay.
#[cfg(test)]
pub fn local_pair() -> (
    (SignalSender, mpsc::UnboundedReceiver<SignalEnvelope>),
    (SignalSender, mpsc::UnboundedReceiver<SignalEnvelope>),
) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    ((SignalSender(a_tx), a_rx), (SignalSender(b_tx), b_rx))
}
