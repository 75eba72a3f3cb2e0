//! The peer-to-peer link: one RTCPeerConnection carrying one ordered data
//! channel, negotiated over the relay.
//!
//! Role is fixed up front: the caller creates the channel and sends the
//! offer, the responder waits. Negotiation bookkeeping (phases, glare, the
//! pre-remote-description candidate queue) lives in [`negotiation`]; this
//! module only drives the WebRTC stack from signaling events.

pub mod negotiation;
pub mod signaling;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;

use crate::protocol::transfer::{EnvelopeSink, SinkError};
use crate::protocol::Envelope;
use negotiation::{Negotiation, NegotiationError};
use signaling::{SignalEnvelope, SignalSender};

const DATA_CHANNEL_LABEL: &str = "chat";

#[derive(Debug)]
pub enum LinkEvent {
    ChannelOpen,
    ChannelClosed,
    /// One raw text frame from the data channel.
    Inbound(String),
    /// The link is unusable and will not recover.
    Failed(String),
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error(transparent)]
    WebRtc(#[from] webrtc::Error),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Signaling(#[from] signaling::SignalingError),
    #[error("data channel is not open")]
    ChannelNotOpen,
}

pub struct PeerLink {
    peer_connection: Arc<RTCPeerConnection>,
    channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
}

impl PeerLink {
    /// Builds the connection, wires all callbacks, and (for the caller)
    /// sends the offer. Returns alongside the event stream the UI loop
    /// consumes. Negotiation then proceeds in a background task driven by
    /// inbound signals.
    pub async fn connect(
        signals: SignalSender,
        signal_rx: mpsc::UnboundedReceiver<SignalEnvelope>,
        stun_servers: Vec<String>,
        caller: bool,
    ) -> Result<(Self, mpsc::UnboundedReceiver<LinkEvent>), LinkError> {
        let api = APIBuilder::new().build();
        let ice_servers = if stun_servers.is_empty() {
            vec![]
        } else {
            vec![RTCIceServer {
                urls: stun_servers,
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let peer_connection = Arc::new(api.new_peer_connection(config).await?);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>> = Arc::new(RwLock::new(None));
        let negotiation: Arc<Mutex<Negotiation<RTCIceCandidateInit>>> =
            Arc::new(Mutex::new(Negotiation::new()));

        let signals_for_ice = signals.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let signals = signals_for_ice.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = signals.send(SignalEnvelope::candidate(init));
                    }
                    Err(err) => warn!(error = %err, "failed to serialize ICE candidate"),
                }
            })
        }));

        let events_for_state = event_tx.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let events = events_for_state.clone();
                Box::pin(async move {
                    debug!(?state, "peer connection state changed");
                    match state {
                        RTCPeerConnectionState::Failed => {
                            let _ = events
                                .send(LinkEvent::Failed("peer connection failed".into()));
                        }
                        RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Closed => {
                            let _ = events.send(LinkEvent::ChannelClosed);
                        }
                        _ => {}
                    }
                })
            },
        ));

        if caller {
            let init = RTCDataChannelInit {
                ordered: Some(true),
                ..Default::default()
            };
            let dc = peer_connection
                .create_data_channel(DATA_CHANNEL_LABEL, Some(init))
                .await?;
            wire_channel(&dc, event_tx.clone(), negotiation.clone());
            *channel.write().await = Some(dc);
        } else {
            let channel_slot = channel.clone();
            let event_tx = event_tx.clone();
            let negotiation_for_dc = negotiation.clone();
            peer_connection.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let channel_slot = channel_slot.clone();
                let event_tx = event_tx.clone();
                let negotiation = negotiation_for_dc.clone();
                Box::pin(async move {
                    info!(label = dc.label(), "data channel announced");
                    wire_channel(&dc, event_tx, negotiation);
                    *channel_slot.write().await = Some(dc);
                })
            }));
        }

        if caller {
            let offer = peer_connection.create_offer(None).await?;
            peer_connection.set_local_description(offer.clone()).await?;
            negotiation.lock().await.begin_offer()?;
            signals.send(SignalEnvelope::offer(offer))?;
            info!("offer sent");
        }

        tokio::spawn(drive_signals(
            signal_rx,
            signals,
            peer_connection.clone(),
            negotiation,
            event_tx,
        ));

        Ok((
            Self {
                peer_connection,
                channel,
            },
            event_rx,
        ))
    }

    pub async fn send_text(&self, text: String) -> Result<(), LinkError> {
        let guard = self.channel.read().await;
        let dc = guard.as_ref().ok_or(LinkError::ChannelNotOpen)?;
        dc.send_text(text).await?;
        Ok(())
    }

    pub async fn close(&self) {
        if let Err(err) = self.peer_connection.close().await {
            debug!(error = %err, "error closing peer connection");
        }
    }
}

#[async_trait]
impl EnvelopeSink for PeerLink {
    async fn send(&self, envelope: &Envelope) -> Result<(), SinkError> {
        let text = serde_json::to_string(envelope).map_err(|err| SinkError(err.to_string()))?;
        self.send_text(text)
            .await
            .map_err(|err| SinkError(err.to_string()))
    }
}

fn wire_channel(
    dc: &Arc<RTCDataChannel>,
    events: mpsc::UnboundedSender<LinkEvent>,
    negotiation: Arc<Mutex<Negotiation<RTCIceCandidateInit>>>,
) {
    let events_for_open = events.clone();
    let negotiation_for_open = negotiation.clone();
    dc.on_open(Box::new(move || {
        let events = events_for_open.clone();
        let negotiation = negotiation_for_open.clone();
        Box::pin(async move {
            if negotiation.lock().await.channel_open() {
                let _ = events.send(LinkEvent::ChannelOpen);
            }
        })
    }));

    let events_for_message = events.clone();
    dc.on_message(Box::new(move |message: DataChannelMessage| {
        let events = events_for_message.clone();
        Box::pin(async move {
            if !message.is_string {
                debug!("ignoring binary frame");
                return;
            }
            match String::from_utf8(message.data.to_vec()) {
                Ok(text) => {
                    let _ = events.send(LinkEvent::Inbound(text));
                }
                Err(_) => warn!("dropping non-UTF-8 text frame"),
            }
        })
    }));

    let events_for_close = events;
    dc.on_close(Box::new(move || {
        let events = events_for_close.clone();
        let negotiation = negotiation.clone();
        Box::pin(async move {
            negotiation.lock().await.close();
            let _ = events.send(LinkEvent::ChannelClosed);
        })
    }));
}

/// Applies inbound signals to the connection until the relay stream ends.
async fn drive_signals(
    mut signal_rx: mpsc::UnboundedReceiver<SignalEnvelope>,
    signals: SignalSender,
    peer_connection: Arc<RTCPeerConnection>,
    negotiation: Arc<Mutex<Negotiation<RTCIceCandidateInit>>>,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    while let Some(envelope) = signal_rx.recv().await {
        let result = apply_signal(
            envelope,
            &signals,
            &peer_connection,
            &negotiation,
        )
        .await;
        if let Err(err) = result {
            warn!(error = %err, "negotiation failed");
            let _ = events.send(LinkEvent::Failed(err.to_string()));
            return;
        }
    }
    debug!("signaling stream ended");
}

async fn apply_signal(
    envelope: SignalEnvelope,
    signals: &SignalSender,
    peer_connection: &Arc<RTCPeerConnection>,
    negotiation: &Arc<Mutex<Negotiation<RTCIceCandidateInit>>>,
) -> Result<(), LinkError> {
    if let Some(offer) = envelope.offer {
        negotiation.lock().await.on_offer()?;
        peer_connection.set_remote_description(offer).await?;
        let queued = negotiation.lock().await.remote_description_applied();
        for candidate in queued {
            peer_connection.add_ice_candidate(candidate).await?;
        }

        let answer = peer_connection.create_answer(None).await?;
        peer_connection.set_local_description(answer.clone()).await?;
        negotiation.lock().await.answer_sent()?;
        signals.send(SignalEnvelope::answer(answer))?;
        info!("answer sent");
        return Ok(());
    }

    if let Some(answer) = envelope.answer {
        negotiation.lock().await.on_answer()?;
        peer_connection.set_remote_description(answer).await?;
        let queued = negotiation.lock().await.remote_description_applied();
        for candidate in queued {
            peer_connection.add_ice_candidate(candidate).await?;
        }
        info!("answer applied");
        return Ok(());
    }

    if let Some(candidate) = envelope.candidate {
        let ready = negotiation.lock().await.on_candidate(candidate);
        if let Some(candidate) = ready {
            peer_connection.add_ice_candidate(candidate).await?;
        }
        return Ok(());
    }

    debug!("ignoring empty signal envelope");
    Ok(())
}
