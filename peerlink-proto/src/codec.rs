//! JSON serialization for messages and sealed data-channel envelopes.
//!
//! A [`Message`] is serialized to JSON bytes, encrypted, and the ciphertext
//! travels inside a [`SealedEnvelope`]: `{"data": [..], "iv": [..]}`, one
//! text frame per data-channel message.

use serde::{Deserialize, Serialize};

use crate::message::Message;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CodecError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Ciphertext plus the initialization vector it was sealed with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedEnvelope {
    /// AEAD ciphertext including the authentication tag.
    pub data: Vec<u8>,
    /// Per-message initialization vector (12 bytes for AES-GCM).
    pub iv: Vec<u8>,
}

impl SealedEnvelope {
    /// Total number of payload bytes carried by this envelope.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.data.len() + self.iv.len()
    }

    /// Returns `true` if the envelope carries no bytes at all.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.data.is_empty() && self.iv.is_empty()
    }
}

/// Encodes a [`Message`] into JSON bytes.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the message cannot be serialized.
pub fn encode_message(message: &Message) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(message)?)
}

/// Decodes a [`Message`] from JSON bytes.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the bytes are not a valid message.
pub fn decode_message(bytes: &[u8]) -> Result<Message, CodecError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Encodes a [`SealedEnvelope`] as the JSON text sent on a data channel.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the envelope cannot be serialized.
pub fn encode_envelope(envelope: &SealedEnvelope) -> Result<String, CodecError> {
    Ok(serde_json::to_string(envelope)?)
}

/// Decodes a [`SealedEnvelope`] from data-channel text.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the text is not a valid envelope.
pub fn decode_envelope(text: &str) -> Result<SealedEnvelope, CodecError> {
    Ok(serde_json::from_str(text)?)
}
