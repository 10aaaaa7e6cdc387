//! Delivery bookkeeping: outbound pending queues, inbound duplicate
//! detection and inbound batching.

pub mod batch;
pub mod dedup;
pub mod pending;

use std::fmt;

use peerlink_proto::codec::CodecError;
use peerlink_proto::message::ValidationError;

use crate::crypto::CryptoError;
use crate::peer::PeerError;
use crate::store::StoreError;

/// Result of handing a message to the delivery layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written to an open data channel.
    Sent,
    /// Held for later: in the pending queue or the offline store.
    Queued,
    /// Dropped: invalid, or a receipt with no open channel.
    Failed,
}

impl SendOutcome {
    /// Combine per-member outcomes of a fan-out: `Sent` if any member was
    /// reached, else `Queued` if any was queued, else `Failed`.
    pub fn combine(outcomes: impl IntoIterator<Item = Self>) -> Self {
        outcomes
            .into_iter()
            .fold(Self::Failed, |best, outcome| match (best, outcome) {
                (Self::Sent, _) | (_, Self::Sent) => Self::Sent,
                (Self::Queued, _) | (_, Self::Queued) => Self::Queued,
                _ => Self::Failed,
            })
    }

    /// Whether the message was sent or queued.
    #[must_use]
    pub const fn is_accepted(self) -> bool {
        !matches!(self, Self::Failed)
    }
}

impl fmt::Display for SendOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sent => write!(f, "sent"),
            Self::Queued => write!(f, "queued"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Errors inside the delivery pipeline. These are logged and turned into
/// notices or [`SendOutcome`]s; they never reach the caller of a send.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// Message validation failed.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Sealing or opening failed.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Envelope (de)serialization failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The peer layer could not transmit.
    #[error("peer error: {0}")]
    Peer(#[from] PeerError),

    /// The offline store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
