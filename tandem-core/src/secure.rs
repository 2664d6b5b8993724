//! Session crypto: ephemeral X25519 key pair and the ChaCha20-Poly1305 box for sensitive packets.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;

/// X25519 public key (32 bytes). Serializable for the handshake packets.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "bytes_32")] [u8; KEY_SIZE]);

mod bytes_32 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        PublicKey(bytes)
    }
}

/// Ephemeral key pair, regenerated for every connection.
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey(X25519PublicKey::from(&secret).to_bytes());
        Self { secret, public }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn shared_secret(&self, other_public: &PublicKey) -> [u8; KEY_SIZE] {
        let other = X25519PublicKey::from(other_public.0);
        self.secret.diffie_hellman(&other).to_bytes()
    }
}

/// Derive the symmetric box key from the X25519 shared secret.
pub fn derive_session_key(shared_secret: &[u8; KEY_SIZE]) -> [u8; KEY_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(b"tandem-session-v1");
    hasher.update(shared_secret);
    hasher.finalize().into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Uninitialized,
    KeysGenerated,
    /// Shared key derived; sensitive packets can flow.
    PeerKeyKnown,
}

/// Authenticated-encryption box for one session.
///
/// Sealed bodies are `nonce (12 bytes) || ciphertext+tag`. Nonces are random, so datagrams
/// may arrive in any order.
pub struct SecureChannel {
    keypair: Option<Keypair>,
    cipher: Option<ChaCha20Poly1305>,
}

impl SecureChannel {
    pub fn new() -> Self {
        Self {
            keypair: None,
            cipher: None,
        }
    }

    pub fn state(&self) -> ChannelState {
        match (&self.keypair, &self.cipher) {
            (None, _) => ChannelState::Uninitialized,
            (Some(_), None) => ChannelState::KeysGenerated,
            (Some(_), Some(_)) => ChannelState::PeerKeyKnown,
        }
    }

    /// Start a fresh session: new key pair, no peer key.
    pub fn generate_keys(&mut self) {
        self.keypair = Some(Keypair::generate());
        self.cipher = None;
    }

    /// Drop all key material.
    pub fn reset(&mut self) {
        self.keypair = None;
        self.cipher = None;
    }

    pub fn extract_public_key(&self) -> Result<PublicKey, CryptoError> {
        self.keypair
            .as_ref()
            .map(|kp| kp.public_key().clone())
            .ok_or(CryptoError::NotReady)
    }

    /// Complete the key exchange.
    pub fn set_peer_key(&mut self, peer: &PublicKey) -> Result<(), CryptoError> {
        let keypair = self.keypair.as_ref().ok_or(CryptoError::NotReady)?;
        let key = derive_session_key(&keypair.shared_secret(peer));
        let cipher = ChaCha20Poly1305::new_from_slice(&key).map_err(|_| CryptoError::Key)?;
        self.cipher = Some(cipher);
        Ok(())
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = self.cipher.as_ref().ok_or(CryptoError::NotReady)?;
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| CryptoError::Encrypt)?;
        let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = self.cipher.as_ref().ok_or(CryptoError::NotReady)?;
        if sealed.len() < NONCE_SIZE {
            return Err(CryptoError::Truncated);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decrypt)
    }
}

impl Default for SecureChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("secure channel is not ready")]
    NotReady,
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed (authentication tag mismatch)")]
    Decrypt,
    #[error("encrypted body too short")]
    Truncated,
}
