//! Per-link asymmetric encryption.
//!
//! Each PeerLink generates a fresh X25519 keypair after its data channel
//! opens; public keys are exchanged over the channel (see
//! `protocol::handshake`) and every chat message is sealed to the recipient:
//! ephemeral X25519 ECDH, HKDF-SHA256 key derivation, ChaCha20Poly1305.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

const HKDF_INFO: &[u8] = b"parley:message:v1";
const NONCE_SIZE: usize = 12;
const PUBLIC_KEY_SIZE: usize = 32;
// ephemeral public key + nonce + at least the Poly1305 tag
const MIN_SEALED_SIZE: usize = PUBLIC_KEY_SIZE + NONCE_SIZE + 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("public key is not valid base64")]
    BadEncoding,
    #[error("public key has wrong length")]
    BadKeyLength,
    #[error("sealed payload is truncated")]
    Truncated,
    #[error("encryption failed")]
    SealFailed,
    #[error("decryption failed")]
    OpenFailed,
}

/// Fresh keypair generated per PeerLink, never reused across links.
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Exported form carried in the `public-key` envelope.
    pub fn public_base64(&self) -> String {
        BASE64.encode(self.public.as_bytes())
    }

    pub fn open(&self, sealed_base64: &str) -> Result<Vec<u8>, CryptoError> {
        open(sealed_base64, &self.secret)
    }
}

pub fn import_public(key_base64: &str) -> Result<PublicKey, CryptoError> {
    let bytes = BASE64
        .decode(key_base64)
        .map_err(|_| CryptoError::BadEncoding)?;
    let array: [u8; PUBLIC_KEY_SIZE] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::BadKeyLength)?;
    Ok(PublicKey::from(array))
}

/// Seals plaintext to the recipient's public key.
///
/// Output layout, base64-encoded: ephemeral public key (32) || nonce (12) ||
/// ciphertext with tag. The ephemeral secret is dropped after the exchange,
/// so only the recipient's static secret can recover the message.
pub fn seal(plaintext: &[u8], recipient: &PublicKey) -> Result<String, CryptoError> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(recipient);

    let key = derive_key(shared.as_bytes())?;
    let cipher = ChaCha20Poly1305::new_from_slice(&key).map_err(|_| CryptoError::SealFailed)?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| CryptoError::SealFailed)?;

    let mut sealed = Vec::with_capacity(PUBLIC_KEY_SIZE + NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(ephemeral_public.as_bytes());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(sealed))
}

pub fn open(sealed_base64: &str, secret: &StaticSecret) -> Result<Vec<u8>, CryptoError> {
    let sealed = BASE64
        .decode(sealed_base64)
        .map_err(|_| CryptoError::BadEncoding)?;
    if sealed.len() < MIN_SEALED_SIZE {
        return Err(CryptoError::Truncated);
    }

    let mut ephemeral_bytes = [0u8; PUBLIC_KEY_SIZE];
    ephemeral_bytes.copy_from_slice(&sealed[..PUBLIC_KEY_SIZE]);
    let ephemeral_public = PublicKey::from(ephemeral_bytes);
    let shared = secret.diffie_hellman(&ephemeral_public);

    let key = derive_key(shared.as_bytes())?;
    let cipher = ChaCha20Poly1305::new_from_slice(&key).map_err(|_| CryptoError::OpenFailed)?;

    let nonce = Nonce::from_slice(&sealed[PUBLIC_KEY_SIZE..PUBLIC_KEY_SIZE + NONCE_SIZE]);
    cipher
        .decrypt(nonce, &sealed[PUBLIC_KEY_SIZE + NONCE_SIZE..])
        .map_err(|_| CryptoError::OpenFailed)
}

fn derive_key(shared_secret: &[u8]) -> Result<[u8; 32], CryptoError> {
    let hkdf = Hkdf::<Sha256>::new(None, shared_secret);
    let mut key = [0u8; 32];
    hkdf.expand(HKDF_INFO, &mut key)
        .map_err(|_| CryptoError::SealFailed)?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let recipient = KeyPair::generate();
        let remote = import_public(&recipient.public_base64()).expect("import");

        let sealed = seal(b"the password is hunter2", &remote).expect("seal");
        let opened = recipient.open(&sealed).expect("open");
        assert_eq!(opened, b"the password is hunter2");
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let recipient = KeyPair::generate();
        let eavesdropper = KeyPair::generate();
        let remote = import_public(&recipient.public_base64()).expect("import");

        let sealed = seal(b"secret", &remote).expect("seal");
        assert!(matches!(
            eavesdropper.open(&sealed),
            Err(CryptoError::OpenFailed)
        ));
    }

    #[test]
    fn truncated_payload_rejected() {
        let recipient = KeyPair::generate();
        let short = BASE64.encode([0u8; 10]);
        assert!(matches!(
            recipient.open(&short),
            Err(CryptoError::Truncated)
        ));
        assert!(matches!(
            recipient.open("%%%not-base64%%%"),
            Err(CryptoError::BadEncoding)
        ));
    }

    #[test]
    fn imported_key_must_be_32_bytes() {
        let bad = BASE64.encode([1u8; 16]);
        assert!(matches!(
            import_public(&bad),
            Err(CryptoError::BadKeyLength)
        ));
    }
}
