//! Signaling wire protocol between peers and the signaling relay.
//!
//! Frames are JSON text with a `type` tag:
//!
//! ```json
//! {"type":"offer","offer":{"type":"offer","sdp":"..."},"recipientId":"b","senderId":"a"}
//! {"type":"user_status_change","userId":"u1","peerId":"a","status":"online"}
//! ```
//!
//! The relay reads only the routing fields (`recipientId`, `senderId`,
//! `peerId`); session descriptions and candidates pass through untouched.

use serde::{Deserialize, Serialize};

use crate::codec::CodecError;
use crate::message::{PeerId, UserId};
use crate::presence::PresenceStatus;

/// Whether a session description is an offer or an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Created by the side initiating negotiation.
    Offer,
    /// Created in response to an offer.
    Answer,
}

/// A session description as exchanged during negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer.
    #[serde(rename = "type")]
    pub kind: SdpKind,
    /// Opaque SDP text.
    pub sdp: String,
}

impl SessionDescription {
    /// Wraps SDP text as an offer.
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Wraps SDP text as an answer.
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A trickled ICE candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate line.
    pub candidate: String,
    /// Media stream identification tag.
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// Index of the media description the candidate belongs to.
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    /// Creates a candidate with no media association.
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// Frames exchanged with the signaling relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SignalMessage {
    /// Negotiation offer routed to `recipient_id`.
    Offer {
        /// The offer description.
        offer: SessionDescription,
        /// Peer that should receive the offer.
        recipient_id: PeerId,
        /// Peer that created the offer (overwritten by the relay).
        sender_id: PeerId,
    },
    /// Negotiation answer routed to `recipient_id`.
    Answer {
        /// The answer description.
        answer: SessionDescription,
        /// Peer that should receive the answer.
        recipient_id: PeerId,
        /// Peer that created the answer (overwritten by the relay).
        sender_id: PeerId,
    },
    /// Trickled ICE candidate routed to `recipient_id`.
    IceCandidate {
        /// The candidate.
        candidate: IceCandidate,
        /// Peer that should receive the candidate.
        recipient_id: PeerId,
        /// Peer that gathered the candidate (overwritten by the relay).
        sender_id: PeerId,
    },
    /// First frame on every connection: announces the local identity.
    UserConnected {
        /// The connecting peer.
        peer_id: PeerId,
        /// Authenticated user, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<UserId>,
    },
    /// Presence transition broadcast by the relay.
    UserStatusChange {
        /// Authenticated user, if the peer announced one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<UserId>,
        /// The peer whose status changed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer_id: Option<PeerId>,
        /// The new status.
        status: PresenceStatus,
    },
}

impl SignalMessage {
    /// Peer this frame should be routed to, for routed frame types.
    #[must_use]
    pub const fn recipient(&self) -> Option<&PeerId> {
        match self {
            Self::Offer { recipient_id, .. }
            | Self::Answer { recipient_id, .. }
            | Self::IceCandidate { recipient_id, .. } => Some(recipient_id),
            Self::UserConnected { .. } | Self::UserStatusChange { .. } => None,
        }
    }

    /// Peer that claims to have sent this frame, for routed frame types.
    #[must_use]
    pub const fn sender(&self) -> Option<&PeerId> {
        match self {
            Self::Offer { sender_id, .. }
            | Self::Answer { sender_id, .. }
            | Self::IceCandidate { sender_id, .. } => Some(sender_id),
            Self::UserConnected { .. } | Self::UserStatusChange { .. } => None,
        }
    }

    /// Replaces the sender of a routed frame.
    ///
    /// The relay calls this with the registered identity of the socket the
    /// frame arrived on, so a client cannot spoof another peer.
    #[must_use]
    pub fn with_sender(mut self, sender: PeerId) -> Self {
        match &mut self {
            Self::Offer { sender_id, .. }
            | Self::Answer { sender_id, .. }
            | Self::IceCandidate { sender_id, .. } => *sender_id = sender,
            Self::UserConnected { .. } | Self::UserStatusChange { .. } => {}
        }
        self
    }

    /// Short name of the frame type, for logs.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice_candidate",
            Self::UserConnected { .. } => "user_connected",
            Self::UserStatusChange { .. } => "user_status_change",
        }
    }
}

/// Encodes a [`SignalMessage`] as JSON text.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the frame cannot be serialized.
pub fn encode(msg: &SignalMessage) -> Result<String, CodecError> {
    Ok(serde_json::to_string(msg)?)
}

/// Decodes a [`SignalMessage`] from JSON text.
///
/// # Errors
///
/// Returns `CodecError::Serialization` for malformed or unknown frames.
pub fn decode(text: &str) -> Result<SignalMessage, CodecError> {
    Ok(serde_json::from_str(text)?)
}
