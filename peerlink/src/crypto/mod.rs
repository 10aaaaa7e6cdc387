//! Message sealing for data channels.
//!
//! [`encrypt`] and [`decrypt`] are the only place where a [`Message`] exists
//! as plaintext bytes: everything handed to a data channel or the offline
//! store has already passed through [`CryptoGuard::seal`], and everything
//! received goes through [`CryptoGuard::open`] before it is interpreted.
//!
//! The cipher is AES-256-GCM with a fresh random 12-byte IV per message.

pub mod keys;

use std::sync::Arc;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};

use peerlink_proto::codec::{self, CodecError, SealedEnvelope};
use peerlink_proto::message::{Message, PeerId};

use keys::{KeyProvider, SessionKey};

/// Length of the AES-GCM initialization vector in bytes.
pub const IV_LEN: usize = 12;

/// Errors that can occur during cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// No key is available for the peer.
    #[error("no session key for peer {0}")]
    NoKey(PeerId),

    /// Key material has the wrong shape.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The IV does not have the expected length.
    #[error("invalid IV length: {len} bytes (expected {IV_LEN})")]
    InvalidIv {
        /// Length that was received.
        len: usize,
    },

    /// Encryption failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed (corrupted ciphertext, wrong key, or tampered data).
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    /// The plaintext could not be (de)serialized.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Serialize and encrypt a message under `key` with a fresh IV.
///
/// # Errors
///
/// Returns [`CryptoError::Codec`] if the message cannot be serialized or
/// [`CryptoError::EncryptionFailed`] if the cipher rejects the input.
pub fn encrypt(key: &SessionKey, message: &Message) -> Result<SealedEnvelope, CryptoError> {
    let plaintext = codec::encode_message(message)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let data = cipher
        .encrypt(&nonce, plaintext.as_ref())
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
    Ok(SealedEnvelope {
        data,
        iv: nonce.to_vec(),
    })
}

/// Decrypt `data` with `key` and `iv` and parse the message inside.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidIv`] for a malformed IV,
/// [`CryptoError::DecryptionFailed`] when authentication fails (tampering or
/// key mismatch) and [`CryptoError::Codec`] if the plaintext is not a
/// message.
pub fn decrypt(key: &SessionKey, data: &[u8], iv: &[u8]) -> Result<Message, CryptoError> {
    if iv.len() != IV_LEN {
        return Err(CryptoError::InvalidIv { len: iv.len() });
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(iv), data)
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;
    Ok(codec::decode_message(&plaintext)?)
}

/// Binds a [`KeyProvider`] to the encrypt/decrypt contract.
#[derive(Clone)]
pub struct CryptoGuard {
    keys: Arc<dyn KeyProvider>,
}

impl CryptoGuard {
    /// Creates a guard that looks keys up in `keys`.
    pub fn new(keys: Arc<dyn KeyProvider>) -> Self {
        Self { keys }
    }

    /// Seal `message` for transmission to `peer`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::NoKey`] if the provider has no key for the peer,
    /// or any error from [`encrypt`].
    pub fn seal(&self, peer: &PeerId, message: &Message) -> Result<SealedEnvelope, CryptoError> {
        let key = self.keys.key_for(peer)?;
        encrypt(&key, message)
    }

    /// Open an envelope received from `peer`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::NoKey`] if the provider has no key for the peer,
    /// or any error from [`decrypt`].
    pub fn open(&self, peer: &PeerId, envelope: &SealedEnvelope) -> Result<Message, CryptoError> {
        let key = self.keys.key_for(peer)?;
        decrypt(&key, &envelope.data, &envelope.iv)
    }
}

impl std::fmt::Debug for CryptoGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoGuard").finish_non_exhaustive()
    }
}
