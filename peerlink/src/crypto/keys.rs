//! Session keys and key lookup.
//!
//! Every session generates one AES-256 [`SessionKey`]. The
//! [`KeyProvider`] trait decides which key seals traffic for a given peer;
//! [`SharedKeyProvider`] hands out the same key for everyone, which only
//! works when all peers were provisioned with that key out of band.
//! [`PeerKeyRing`] holds per-peer keys for deployments that exchange them.

use std::collections::HashMap;

use aes_gcm::Aes256Gcm;
use aes_gcm::aead::{KeyInit, OsRng};
use parking_lot::RwLock;
use zeroize::{Zeroize, ZeroizeOnDrop};

use peerlink_proto::message::PeerId;

use super::CryptoError;

/// Length of an AES-256 key in bytes.
pub const KEY_LEN: usize = 32;

/// A 256-bit symmetric key, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    /// Generate a new random key using the system's CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(OsRng);
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(key.as_slice());
        Self(bytes)
    }

    /// Load a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] unless `bytes` is exactly
    /// [`KEY_LEN`] long.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "key must be {KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    /// Raw key bytes. Never log or transmit these.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Parse a key from 64 hex characters.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] for anything else.
    pub fn from_hex(hex: &str) -> Result<Self, CryptoError> {
        if hex.len() != KEY_LEN * 2 || !hex.is_ascii() {
            return Err(CryptoError::InvalidKey(format!(
                "expected {} hex characters",
                KEY_LEN * 2
            )));
        }
        let mut key = [0u8; KEY_LEN];
        for (byte, pair) in key.iter_mut().zip(hex.as_bytes().chunks(2)) {
            let pair = std::str::from_utf8(pair)
                .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
            *byte = u8::from_str_radix(pair, 16)
                .map_err(|e| CryptoError::InvalidKey(format!("{pair}: {e}")))?;
        }
        Ok(Self(key))
    }

    /// The full key as lowercase hex, for out-of-band sharing.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex_string(&self.0)
    }

    /// Short hex fingerprint of the key for display and logs.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        hex_string(&self.0[..4])
    }
}

fn hex_string(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::new(), |mut output, b| {
        let _ = write!(output, "{b:02x}");
        output
    })
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionKey({}..)", self.fingerprint())
    }
}

/// Chooses the key used to seal and open traffic with a peer.
pub trait KeyProvider: Send + Sync {
    /// Returns the key for `peer`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::NoKey`] if no key is known for the peer.
    fn key_for(&self, peer: &PeerId) -> Result<SessionKey, CryptoError>;
}

/// Uses one key for every peer.
///
/// Two sessions can only talk if they were created with the same key, so
/// this is suitable for tests and pre-shared deployments only.
#[derive(Debug, Clone)]
pub struct SharedKeyProvider {
    key: SessionKey,
}

impl SharedKeyProvider {
    /// Wrap an existing key.
    #[must_use]
    pub const fn new(key: SessionKey) -> Self {
        Self { key }
    }

    /// Generate a fresh shared key.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(SessionKey::generate())
    }

    /// The shared key.
    #[must_use]
    pub const fn key(&self) -> &SessionKey {
        &self.key
    }
}

impl KeyProvider for SharedKeyProvider {
    fn key_for(&self, _peer: &PeerId) -> Result<SessionKey, CryptoError> {
        Ok(self.key.clone())
    }
}

/// Per-peer keys with an optional fallback.
#[derive(Debug, Default)]
pub struct PeerKeyRing {
    keys: RwLock<HashMap<PeerId, SessionKey>>,
    fallback: Option<SessionKey>,
}

impl PeerKeyRing {
    /// Creates an empty key ring with no fallback.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a key ring that falls back to `key` for unknown peers.
    #[must_use]
    pub fn with_fallback(key: SessionKey) -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
            fallback: Some(key),
        }
    }

    /// Set the key for `peer`, returning the key it replaces.
    pub fn insert(&self, peer: PeerId, key: SessionKey) -> Option<SessionKey> {
        self.keys.write().insert(peer, key)
    }

    /// Forget the key for `peer`.
    pub fn remove(&self, peer: &PeerId) -> Option<SessionKey> {
        self.keys.write().remove(peer)
    }
}

impl KeyProvider for PeerKeyRing {
    fn key_for(&self, peer: &PeerId) -> Result<SessionKey, CryptoError> {
        if let Some(key) = self.keys.read().get(peer) {
            return Ok(key.clone());
        }
        self.fallback
            .clone()
            .ok_or_else(|| CryptoError::NoKey(peer.clone()))
    }
}
