//! Key exchange over an open data channel.
//!
//! Both sides generate a fresh keypair when the channel opens and announce
//! their public key with `is_response = false`. A side that receives an
//! announcement replies with its own key and `is_response = true`; a side
//! that receives a response only imports it. The `is_response` flag is what
//! terminates the exchange: exactly two `public-key` envelopes cross the
//! channel no matter which side opens first or whether both announce
//! simultaneously.

use x25519_dalek::PublicKey;

use crate::crypto::{self, CryptoError, KeyPair};
use crate::protocol::Envelope;

pub struct Handshake {
    local: KeyPair,
    remote: Option<PublicKey>,
}

impl Handshake {
    pub fn new() -> Self {
        Self {
            local: KeyPair::generate(),
            remote: None,
        }
    }

    /// The announcement to send once the channel opens.
    pub fn public_envelope(&self, is_response: bool) -> Envelope {
        Envelope::PublicKey {
            key: self.local.public_base64(),
            is_response,
        }
    }

    /// Handles an inbound `public-key` envelope. Returns the response
    /// envelope to send back, if one is due.
    pub fn on_public_key(
        &mut self,
        key: &str,
        is_response: bool,
    ) -> Result<Option<Envelope>, CryptoError> {
        self.remote = Some(crypto::import_public(key)?);
        if is_response {
            Ok(None)
        } else {
            Ok(Some(self.public_envelope(true)))
        }
    }

    /// True once the remote key has been imported and sealing can begin.
    pub fn is_ready(&self) -> bool {
        self.remote.is_some()
    }

    pub fn seal_for_peer(&self, plaintext: &[u8]) -> Result<Option<String>, CryptoError> {
        match &self.remote {
            Some(remote) => crypto::seal(plaintext, remote).map(Some),
            None => Ok(None),
        }
    }

    pub fn open(&self, sealed_base64: &str) -> Result<Vec<u8>, CryptoError> {
        self.local.open(sealed_base64)
    }
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}
