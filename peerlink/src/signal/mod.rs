//! Signaling: offer/answer/candidate exchange and presence via a relay.
//!
//! The [`SignalSender`] trait is the outbound seam used by the peer
//! connection manager. Inbound traffic arrives as [`SignalingEvent`]s on an
//! `mpsc` receiver. Implementations:
//! - [`client::SignalingClient`]: WebSocket client with auto-reconnect
//! - [`loopback::LoopbackSignalHub`]: in-process relay for tests

pub mod backoff;
pub mod client;
pub mod loopback;

use std::time::Duration;

use peerlink_proto::codec::CodecError;
use peerlink_proto::message::{PeerId, UserId};
use peerlink_proto::presence::PresenceStatus;
use peerlink_proto::signal::{IceCandidate, SessionDescription, SignalMessage};

/// Errors that can occur when sending signaling frames.
#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    /// The relay connection is down.
    #[error("signaling connection is not established")]
    NotConnected,

    /// Connecting to the relay timed out.
    #[error("signaling connect timed out")]
    Timeout,

    /// The relay URL is invalid or could not be reached.
    #[error("signaling relay unreachable: {0}")]
    Unreachable(String),

    /// A frame could not be encoded or decoded.
    #[error("signaling codec error: {0}")]
    Codec(#[from] CodecError),

    /// The WebSocket failed.
    #[error("signaling I/O error: {0}")]
    Io(String),
}

/// Events delivered by a signaling implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    /// The relay connection was established (first time or after reconnect).
    Connected,
    /// The relay connection dropped.
    Disconnected,
    /// A reconnect attempt is scheduled after `delay`.
    Reconnecting {
        /// 1-based attempt number.
        attempt: u32,
        /// Wait before the attempt.
        delay: Duration,
    },
    /// All reconnect attempts failed; no further attempts will be made.
    Unavailable {
        /// Number of attempts made.
        attempts: u32,
    },
    /// A non-fatal error worth surfacing.
    Error(String),
    /// A remote peer sent an offer.
    Offer {
        /// The offering peer.
        from: PeerId,
        /// Its offer.
        offer: SessionDescription,
    },
    /// A remote peer answered our offer.
    Answer {
        /// The answering peer.
        from: PeerId,
        /// Its answer.
        answer: SessionDescription,
    },
    /// A remote peer trickled an ICE candidate.
    IceCandidate {
        /// The peer that gathered the candidate.
        from: PeerId,
        /// The candidate.
        candidate: IceCandidate,
    },
    /// A peer or user changed presence.
    PresenceChanged {
        /// Peer session concerned, when the relay knows it.
        peer: Option<PeerId>,
        /// Authenticated user concerned, if any.
        user: Option<UserId>,
        /// New status.
        status: PresenceStatus,
    },
}

/// Outbound half of a signaling implementation.
pub trait SignalSender: Send + Sync + 'static {
    /// Send a frame to the relay.
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::NotConnected`] while the relay is
    /// unreachable, or an encoding/I/O error.
    fn send(
        &self,
        message: SignalMessage,
    ) -> impl std::future::Future<Output = Result<(), SignalingError>> + Send;

    /// Whether the relay connection is currently up.
    fn is_connected(&self) -> bool;

    /// The local peer identity this sender announces.
    fn local_id(&self) -> &PeerId;
}

/// Translate an inbound frame into an event for `local`.
///
/// Routed frames addressed to someone else are dropped; presence frames
/// about the local peer itself are dropped too.
#[must_use]
pub fn event_from_message(local: &PeerId, message: SignalMessage) -> Option<SignalingEvent> {
    if let Some(recipient) = message.recipient()
        && recipient != local
    {
        tracing::debug!(
            recipient = %recipient,
            kind = message.type_name(),
            "ignoring signaling frame addressed to another peer"
        );
        return None;
    }

    match message {
        SignalMessage::Offer {
            offer, sender_id, ..
        } => Some(SignalingEvent::Offer {
            from: sender_id,
            offer,
        }),
        SignalMessage::Answer {
            answer, sender_id, ..
        } => Some(SignalingEvent::Answer {
            from: sender_id,
            answer,
        }),
        SignalMessage::IceCandidate {
            candidate,
            sender_id,
            ..
        } => Some(SignalingEvent::IceCandidate {
            from: sender_id,
            candidate,
        }),
        SignalMessage::UserStatusChange {
            user_id,
            peer_id,
            status,
        } => {
            if peer_id.as_ref() == Some(local) {
                return None;
            }
            Some(SignalingEvent::PresenceChanged {
                peer: peer_id,
                user: user_id,
                status,
            })
        }
        SignalMessage::UserConnected { peer_id, .. } => {
            tracing::debug!(peer = %peer_id, "ignoring inbound user_connected frame");
            None
        }
    }
}
