//! Two-party end-to-end encrypted chat over WebRTC data channels.
//!
//! The relay (see the `parley-relay` app) only authenticates accounts and
//! forwards opaque signaling frames; everything after negotiation flows
//! peer-to-peer. Layers, bottom up:
//!
//! - [`link`]: RTCPeerConnection ownership, offer/answer negotiation,
//!   candidate queueing, the raw text channel.
//! - [`crypto`] and [`protocol::handshake`]: per-link keypairs and the
//!   two-envelope public key exchange.
//! - [`protocol`]: the JSON envelope vocabulary, chunked transfers, and the
//!   multiplexer that turns raw frames into chat events.
//! - [`auth`]: accounts and the single-session rule, over HTTP.

pub mod auth;
pub mod config;
pub mod crypto;
pub mod link;
pub mod protocol;
