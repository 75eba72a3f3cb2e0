//! Single-consumer message multiplexer.
//!
//! One `Multiplexer` owns all per-link protocol state: the key exchange, the
//! presence table, and every in-flight transfer buffer. It is driven from
//! exactly one task (the link event loop), so none of that state needs a
//! lock. Inbound frames that fail to parse, decrypt, or decode are logged
//! and dropped; nothing a peer sends can panic this side.

use std::collections::HashMap;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::crypto::CryptoError;
use crate::protocol::handshake::Handshake;
use crate::protocol::transfer::{
    self, EnvelopeSink, RetryPolicy, SinkError, TransferBuffer, TransferError, INLINE_LIMIT,
};
use crate::protocol::{Envelope, PresenceStatus};

/// Who this side claims to be on the wire.
#[derive(Debug, Clone)]
pub struct Identity {
    pub handle: String,
    /// Random per-process token that keys presence entries, so a rejoining
    /// peer replaces itself instead of appearing twice.
    pub peer_token: String,
}

impl Identity {
    pub fn new(handle: String) -> Self {
        Self {
            handle,
            peer_token: Uuid::new_v4().to_string(),
        }
    }
}

/// What the multiplexer surfaces to the UI loop.
#[derive(Debug)]
pub enum ChatEvent {
    PeerJoined {
        handle: String,
    },
    PeerStatus {
        handle: String,
        status: PresenceStatus,
    },
    Message {
        sender: String,
        body: String,
        timestamp: String,
    },
    FileReceived {
        name: String,
        mime: String,
        payload: Vec<u8>,
    },
    MessageDeleted {
        timestamp: String,
    },
    TransferProgress {
        transfer_id: String,
        received: u32,
        total: u32,
    },
    TransferFailed {
        transfer_id: String,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("cannot send yet: key exchange has not completed")]
    HandshakeIncomplete,
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
}

pub struct Multiplexer {
    identity: Identity,
    handshake: Handshake,
    // peer_token -> handle
    peers: HashMap<String, String>,
    transfers: HashMap<String, TransferBuffer>,
    sink: Arc<dyn EnvelopeSink>,
    events: mpsc::UnboundedSender<ChatEvent>,
    retry: RetryPolicy,
}

impl Multiplexer {
    pub fn new(
        identity: Identity,
        sink: Arc<dyn EnvelopeSink>,
        events: mpsc::UnboundedSender<ChatEvent>,
    ) -> Self {
        Self {
            identity,
            handshake: Handshake::new(),
            peers: HashMap::new(),
            transfers: HashMap::new(),
            sink,
            events,
            retry: RetryPolicy::default(),
        }
    }

    #[cfg(test)]
    fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Announces identity and starts the key exchange. Called each time the
    /// data channel opens; keys are regenerated so a reconnected link never
    /// reuses a keypair.
    pub async fn on_channel_open(&mut self) -> Result<(), MuxError> {
        self.handshake = Handshake::new();
        self.transfers.clear();
        self.sink
            .send(&Envelope::PresenceJoin {
                handle: self.identity.handle.clone(),
                peer_token: self.identity.peer_token.clone(),
            })
            .await?;
        self.sink.send(&self.handshake.public_envelope(false)).await?;
        Ok(())
    }

    /// Dispatches one raw frame from the data channel.
    pub async fn handle_raw(&mut self, raw: &str) {
        let envelope: Envelope = match serde_json::from_str(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "dropping unparseable frame");
                return;
            }
        };
        self.handle_envelope(envelope).await;
    }

    async fn handle_envelope(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::PresenceJoin { handle, peer_token } => {
                // rejoins with a known token are silent
                if self.peers.insert(peer_token, handle.clone()).is_none() {
                    self.emit(ChatEvent::PeerJoined { handle });
                }
            }
            Envelope::PublicKey { key, is_response } => {
                match self.handshake.on_public_key(&key, is_response) {
                    Ok(Some(reply)) => {
                        if let Err(err) = self.sink.send(&reply).await {
                            warn!(error = %err, "failed to answer key announcement");
                        }
                    }
                    Ok(None) => {}
                    Err(err) => warn!(error = %err, "dropping invalid public key"),
                }
            }
            Envelope::Message {
                ciphertext,
                sender,
                timestamp,
            } => match self.handshake.open(&ciphertext) {
                Ok(plaintext) => match String::from_utf8(plaintext) {
                    Ok(body) => self.emit(ChatEvent::Message {
                        sender,
                        body,
                        timestamp,
                    }),
                    Err(_) => warn!("dropping message with non-UTF-8 plaintext"),
                },
                Err(err) => warn!(error = %err, "dropping undecryptable message"),
            },
            Envelope::File {
                name,
                mime,
                size,
                content,
            } => match BASE64.decode(content) {
                Ok(payload) => {
                    if payload.len() as u64 != size {
                        debug!(name, declared = size, actual = payload.len(), "file size mismatch");
                    }
                    self.emit(ChatEvent::FileReceived {
                        name,
                        mime,
                        payload,
                    });
                }
                Err(_) => warn!(name, "dropping file with invalid base64 content"),
            },
            Envelope::TransferStart {
                transfer_id,
                name,
                mime,
                total_size,
                chunk_count,
            } => {
                if self.transfers.contains_key(&transfer_id) {
                    warn!(transfer_id, "duplicate transfer id, ignoring start");
                    return;
                }
                self.transfers.insert(
                    transfer_id,
                    TransferBuffer::new(name, mime, total_size, chunk_count),
                );
            }
            Envelope::TransferChunk {
                transfer_id,
                index,
                data,
            } => {
                let Some(buffer) = self.transfers.get_mut(&transfer_id) else {
                    warn!(transfer_id, index, "chunk for unknown transfer, ignoring");
                    return;
                };
                if !buffer.insert(index, data) {
                    warn!(transfer_id, index, "duplicate or out-of-range chunk");
                    return;
                }
                let (received, total) = (buffer.received(), buffer.chunk_count());
                self.emit(ChatEvent::TransferProgress {
                    transfer_id,
                    received,
                    total,
                });
            }
            Envelope::TransferEnd { transfer_id } => {
                let Some(buffer) = self.transfers.remove(&transfer_id) else {
                    warn!(transfer_id, "end marker for unknown transfer, ignoring");
                    return;
                };
                let name = buffer.name.clone();
                let mime = buffer.mime.clone();
                match buffer.assemble() {
                    Ok(payload) => self.emit(ChatEvent::FileReceived {
                        name,
                        mime,
                        payload,
                    }),
                    Err(err) => {
                        warn!(transfer_id, error = %err, "discarding incomplete transfer");
                        self.emit(ChatEvent::TransferFailed {
                            transfer_id,
                            reason: err.to_string(),
                        });
                    }
                }
            }
            Envelope::Status { handle, status } => {
                self.emit(ChatEvent::PeerStatus { handle, status });
            }
            Envelope::Delete { timestamp } => {
                self.emit(ChatEvent::MessageDeleted { timestamp });
            }
            Envelope::Unknown => debug!("ignoring envelope with unknown tag"),
        }
    }

    /// Seals and sends a chat message. Fails fast until the key exchange has
    /// completed; plaintext never crosses the channel.
    pub async fn send_message(&self, body: &str) -> Result<(), MuxError> {
        let ciphertext = self
            .handshake
            .seal_for_peer(body.as_bytes())?
            .ok_or(MuxError::HandshakeIncomplete)?;
        self.sink
            .send(&Envelope::Message {
                ciphertext,
                sender: self.identity.handle.clone(),
                timestamp: chrono::Utc::now().to_rfc3339(),
            })
            .await?;
        Ok(())
    }

    /// Sends a payload, inline below the fragmentation bound, chunked above.
    pub async fn send_file(
        &self,
        name: &str,
        mime: &str,
        payload: &[u8],
    ) -> Result<(), MuxError> {
        if payload.len() <= INLINE_LIMIT {
            self.sink
                .send(&Envelope::File {
                    name: name.to_string(),
                    mime: mime.to_string(),
                    size: payload.len() as u64,
                    content: BASE64.encode(payload),
                })
                .await?;
            return Ok(());
        }

        let transfer_id = Uuid::new_v4().to_string();
        let events = self.events.clone();
        let progress_id = transfer_id.clone();
        transfer::send_chunked(
            self.sink.as_ref(),
            &transfer_id,
            name,
            mime,
            payload,
            self.retry,
            move |sent, total| {
                let _ = events.send(ChatEvent::TransferProgress {
                    transfer_id: progress_id.clone(),
                    received: sent,
                    total,
                });
            },
        )
        .await?;
        Ok(())
    }

    pub async fn send_delete(&self, timestamp: &str) -> Result<(), MuxError> {
        self.sink
            .send(&Envelope::Delete {
                timestamp: timestamp.to_string(),
            })
            .await?;
        Ok(())
    }

    pub async fn send_status(&self, status: PresenceStatus) -> Result<(), MuxError> {
        self.sink
            .send(&Envelope::Status {
                handle: self.identity.handle.clone(),
                status,
            })
            .await?;
        Ok(())
    }

    pub fn handshake_ready(&self) -> bool {
        self.handshake.is_ready()
    }

    fn emit(&self, event: ChatEvent) {
        // receiver gone means the UI loop exited; nothing left to notify
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    struct RecordingSink {
        sent: Mutex<Vec<Envelope>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<Envelope> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EnvelopeSink for RecordingSink {
        async fn send(&self, envelope: &Envelope) -> Result<(), SinkError> {
            self.sent.lock().unwrap().push(envelope.clone());
            Ok(())
        }
    }

    fn build() -> (
        Multiplexer,
        Arc<RecordingSink>,
        mpsc::UnboundedReceiver<ChatEvent>,
    ) {
        let sink = RecordingSink::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let mux = Multiplexer::new(Identity::new("alice".into()), sink.clone(), tx).with_retry(
            RetryPolicy {
                max_attempts: 3,
                backoff: Duration::ZERO,
            },
        );
        (mux, sink, rx)
    }

    async fn feed(mux: &mut Multiplexer, envelope: &Envelope) {
        mux.handle_raw(&serde_json::to_string(envelope).unwrap())
            .await;
    }

    #[tokio::test]
    async fn channel_open_announces_identity_then_key() {
        let (mut mux, sink, _rx) = build();
        mux.on_channel_open().await.expect("open");

        let sent = sink.sent();
        assert_eq!(sent.len(), 2);
        assert!(matches!(&sent[0], Envelope::PresenceJoin { handle, .. } if handle == "alice"));
        assert!(matches!(
            &sent[1],
            Envelope::PublicKey {
                is_response: false,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn duplicate_presence_join_is_idempotent() {
        let (mut mux, _sink, mut rx) = build();
        let join = Envelope::PresenceJoin {
            handle: "bob".into(),
            peer_token: "tok-1".into(),
        };
        feed(&mut mux, &join).await;
        feed(&mut mux, &join).await;

        assert!(matches!(
            rx.try_recv(),
            Ok(ChatEvent::PeerJoined { handle }) if handle == "bob"
        ));
        assert!(rx.try_recv().is_err(), "second join must not re-emit");
    }

    #[tokio::test]
    async fn send_message_is_gated_on_handshake() {
        let (mux, sink, _rx) = build();
        assert!(matches!(
            mux.send_message("hello").await,
            Err(MuxError::HandshakeIncomplete)
        ));
        assert!(sink.sent().is_empty(), "nothing may leave before exchange");
    }

    #[tokio::test]
    async fn messages_round_trip_between_two_multiplexers() {
        let (mut alice, alice_sink, _arx) = build();
        let sink = RecordingSink::new();
        let (tx, mut brx) = mpsc::unbounded_channel();
        let mut bob = Multiplexer::new(Identity::new("bob".into()), sink.clone(), tx);

        // alice opens; bob consumes her announcements and replies
        alice.on_channel_open().await.expect("open");
        for envelope in alice_sink.sent() {
            feed(&mut bob, &envelope).await;
        }
        // deliver bob's key response back to alice
        for envelope in sink.sent() {
            feed(&mut alice, &envelope).await;
        }
        assert!(alice.handshake_ready());
        assert!(bob.handshake_ready());

        alice.send_message("the canary sings").await.expect("send");
        let message = alice_sink.sent().into_iter().last().unwrap();
        match &message {
            Envelope::Message { ciphertext, .. } => {
                assert!(!ciphertext.contains("canary"), "plaintext must not leak")
            }
            other => panic!("unexpected envelope {:?}", other.tag()),
        }
        feed(&mut bob, &message).await;

        // skip bob's PeerJoined for alice
        loop {
            match brx.try_recv().expect("event") {
                ChatEvent::Message { sender, body, .. } => {
                    assert_eq!(sender, "alice");
                    assert_eq!(body, "the canary sings");
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn duplicate_transfer_start_is_rejected() {
        let (mut mux, _sink, mut rx) = build();
        let start = Envelope::TransferStart {
            transfer_id: "t-1".into(),
            name: "a.bin".into(),
            mime: "application/octet-stream".into(),
            total_size: 4,
            chunk_count: 1,
        };
        feed(&mut mux, &start).await;
        // second start for the same id must not reset the buffer
        feed(
            &mut mux,
            &Envelope::TransferChunk {
                transfer_id: "t-1".into(),
                index: 0,
                data: BASE64.encode(b"data"),
            },
        )
        .await;
        feed(&mut mux, &start).await;
        feed(
            &mut mux,
            &Envelope::TransferEnd {
                transfer_id: "t-1".into(),
            },
        )
        .await;

        let mut saw_payload = false;
        while let Ok(event) = rx.try_recv() {
            if let ChatEvent::FileReceived { payload, .. } = event {
                assert_eq!(payload, b"data");
                saw_payload = true;
            }
        }
        assert!(saw_payload, "existing buffer must survive the replayed start");
    }

    #[tokio::test]
    async fn chunks_for_unknown_transfers_are_ignored() {
        let (mut mux, _sink, mut rx) = build();
        feed(
            &mut mux,
            &Envelope::TransferChunk {
                transfer_id: "nope".into(),
                index: 0,
                data: BASE64.encode(b"x"),
            },
        )
        .await;
        feed(
            &mut mux,
            &Envelope::TransferEnd {
                transfer_id: "nope".into(),
            },
        )
        .await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn incomplete_transfer_fails_and_frees_its_id() {
        let (mut mux, _sink, mut rx) = build();
        let start = Envelope::TransferStart {
            transfer_id: "t-2".into(),
            name: "b.bin".into(),
            mime: "application/octet-stream".into(),
            total_size: 8,
            chunk_count: 2,
        };
        feed(&mut mux, &start).await;
        feed(
            &mut mux,
            &Envelope::TransferChunk {
                transfer_id: "t-2".into(),
                index: 0,
                data: BASE64.encode(b"half"),
            },
        )
        .await;
        feed(
            &mut mux,
            &Envelope::TransferEnd {
                transfer_id: "t-2".into(),
            },
        )
        .await;

        let mut failed = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                ChatEvent::TransferFailed { transfer_id, .. } => {
                    assert_eq!(transfer_id, "t-2");
                    failed = true;
                }
                ChatEvent::FileReceived { .. } => panic!("partial data must not surface"),
                _ => {}
            }
        }
        assert!(failed);

        // the id is free for a fresh attempt
        feed(&mut mux, &start).await;
        for (index, chunk) in [b"full", b"data"].iter().enumerate() {
            feed(
                &mut mux,
                &Envelope::TransferChunk {
                    transfer_id: "t-2".into(),
                    index: index as u32,
                    data: BASE64.encode(chunk),
                },
            )
            .await;
        }
        feed(
            &mut mux,
            &Envelope::TransferEnd {
                transfer_id: "t-2".into(),
            },
        )
        .await;
        let mut delivered = false;
        while let Ok(event) = rx.try_recv() {
            if let ChatEvent::FileReceived { payload, .. } = event {
                assert_eq!(payload, b"fulldata");
                delivered = true;
            }
        }
        assert!(delivered);
    }

    #[tokio::test]
    async fn small_files_go_inline_and_large_files_chunk() {
        let (mux, sink, _rx) = build();

        mux.send_file("note.txt", "text/plain", b"tiny").await.expect("send");
        assert!(matches!(
            sink.sent().last(),
            Some(Envelope::File { size: 4, .. })
        ));

        let big = vec![7u8; INLINE_LIMIT + 1];
        mux.send_file("big.bin", "application/octet-stream", &big)
            .await
            .expect("send");
        let sent = sink.sent();
        assert!(sent
            .iter()
            .any(|e| matches!(e, Envelope::TransferStart { chunk_count: 65, .. })));
        assert!(sent.iter().any(|e| matches!(e, Envelope::TransferEnd { .. })));
    }

    #[tokio::test]
    async fn malformed_and_undecryptable_frames_are_dropped() {
        let (mut mux, _sink, mut rx) = build();
        mux.handle_raw("{not json").await;
        mux.handle_raw(r#"{"type":"message","ciphertext":"AAAA","sender":"x","timestamp":"t"}"#)
            .await;
        assert!(rx.try_recv().is_err());
    }
}
