//! The data-channel wire protocol.
//!
//! Every unit exchanged over an open PeerLink is one UTF-8 JSON `Envelope`
//! with a `type` discriminator. Field names are the cross-implementation
//! contract: two independent builds must agree on them (and on
//! `transfer::CHUNK_SIZE`) to interoperate.

pub mod handshake;
pub mod mux;
pub mod transfer;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum Envelope {
    /// Identity announcement after channel open; idempotent, keyed by
    /// `peer_token` so duplicate joins cannot duplicate presence entries.
    #[serde(rename = "presence-join", rename_all = "camelCase")]
    PresenceJoin { handle: String, peer_token: String },

    /// One-round key exchange: the opener sends `is_response = false`, the
    /// receiver imports and replies with `is_response = true`, the opener
    /// imports and stops. Two envelopes total, whoever opens first.
    #[serde(rename = "public-key", rename_all = "camelCase")]
    PublicKey { key: String, is_response: bool },

    /// An encrypted chat message; `ciphertext` is sealed to the recipient's
    /// public key.
    #[serde(rename = "message")]
    Message {
        ciphertext: String,
        sender: String,
        timestamp: String,
    },

    /// Inline payload below the fragmentation bound (file or voice clip).
    #[serde(rename = "file", rename_all = "camelCase")]
    File {
        name: String,
        mime: String,
        size: u64,
        content: String,
    },

    #[serde(rename = "transfer-start", rename_all = "camelCase")]
    TransferStart {
        transfer_id: String,
        name: String,
        mime: String,
        total_size: u64,
        chunk_count: u32,
    },

    #[serde(rename = "transfer-chunk", rename_all = "camelCase")]
    TransferChunk {
        transfer_id: String,
        index: u32,
        data: String,
    },

    #[serde(rename = "transfer-end", rename_all = "camelCase")]
    TransferEnd { transfer_id: String },

    #[serde(rename = "status")]
    Status {
        handle: String,
        status: PresenceStatus,
    },

    /// Retract the displayed item with a matching timestamp.
    #[serde(rename = "delete")]
    Delete { timestamp: String },

    /// Forward compatibility: tags we do not recognize decode here and are
    /// logged and ignored instead of failing the parse.
    #[serde(other)]
    Unknown,
}

impl Envelope {
    pub fn tag(&self) -> &'static str {
        match self {
            Envelope::PresenceJoin { .. } => "presence-join",
            Envelope::PublicKey { .. } => "public-key",
            Envelope::Message { .. } => "message",
            Envelope::File { .. } => "file",
            Envelope::TransferStart { .. } => "transfer-start",
            Envelope::TransferChunk { .. } => "transfer-chunk",
            Envelope::TransferEnd { .. } => "transfer-end",
            Envelope::Status { .. } => "status",
            Envelope::Delete { .. } => "delete",
            Envelope::Unknown => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_field_names_are_exact() {
        let envelope = Envelope::TransferStart {
            transfer_id: "t-1".into(),
            name: "report.pdf".into(),
            mime: "application/pdf".into(),
            total_size: 5_242_880,
            chunk_count: 320,
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&envelope).unwrap()).unwrap();
        assert_eq!(json["type"], "transfer-start");
        assert_eq!(json["transferId"], "t-1");
        assert_eq!(json["chunkCount"], 320);
        assert_eq!(json["totalSize"], 5_242_880);

        let envelope = Envelope::PublicKey {
            key: "AAAA".into(),
            is_response: true,
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&envelope).unwrap()).unwrap();
        assert_eq!(json["type"], "public-key");
        assert_eq!(json["isResponse"], true);
    }

    #[test]
    fn every_tag_round_trips() {
        let envelopes = vec![
            Envelope::PresenceJoin {
                handle: "alice".into(),
                peer_token: "tok".into(),
            },
            Envelope::PublicKey {
                key: "k".into(),
                is_response: false,
            },
            Envelope::Message {
                ciphertext: "c".into(),
                sender: "alice".into(),
                timestamp: "2026-01-01T00:00:00Z".into(),
            },
            Envelope::File {
                name: "a.txt".into(),
                mime: "text/plain".into(),
                size: 3,
                content: "YWJj".into(),
            },
            Envelope::TransferChunk {
                transfer_id: "t".into(),
                index: 7,
                data: "ZGF0YQ==".into(),
            },
            Envelope::TransferEnd {
                transfer_id: "t".into(),
            },
            Envelope::Status {
                handle: "bob".into(),
                status: PresenceStatus::Offline,
            },
            Envelope::Delete {
                timestamp: "2026-01-01T00:00:00Z".into(),
            },
        ];
        for envelope in envelopes {
            let json = serde_json::to_string(&envelope).unwrap();
            let back: Envelope = serde_json::from_str(&json).unwrap();
            assert_eq!(back, envelope);
        }
    }

    #[test]
    fn unknown_tag_decodes_to_unknown() {
        let decoded: Envelope =
            serde_json::from_str(r#"{"type":"typing-indicator","handle":"alice"}"#).unwrap();
        assert_eq!(decoded, Envelope::Unknown);
    }

    #[test]
    fn status_values_are_lowercase() {
        let decoded: Envelope =
            serde_json::from_str(r#"{"type":"status","handle":"bob","status":"online"}"#).unwrap();
        assert_eq!(
            decoded,
            Envelope::Status {
                handle: "bob".into(),
                status: PresenceStatus::Online,
            }
        );
    }
}
