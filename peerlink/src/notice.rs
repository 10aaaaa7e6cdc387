//! Connection-state notices for the UI layer.
//!
//! Nothing in the delivery core panics or returns errors to the UI for
//! transport, negotiation, crypto or persistence problems. They are logged
//! and surfaced as [`PeerNotice`]s on one bounded stream instead.

use tokio::sync::mpsc;

use peerlink_proto::message::PeerId;

use crate::rtc::ConnectionState;

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoticeKind {
    /// A connection object was created for the peer.
    ConnectionCreated,
    /// The peer connection moved to a new state.
    StateChanged(ConnectionState),
    /// An ICE restart was started after a failure.
    IceRestart,
    /// The connection was torn down and will be recreated.
    Recreating,
    /// Offer/answer/candidate handling failed for the peer.
    NegotiationFailed,
    /// A data channel to the peer opened.
    ChannelOpen,
    /// A data channel to the peer closed.
    ChannelClosed,
    /// A data channel to the peer reported an error.
    ChannelError,
    /// An inbound payload could not be decrypted and was discarded.
    DecryptFailed,
    /// An inbound payload was malformed, oversized or spoofed and was discarded.
    PayloadDropped,
    /// The offline store failed; the message was kept in the pending queue.
    StoreFallback,
    /// The peer came online.
    PeerOnline,
    /// The peer went offline.
    PeerOffline,
    /// The signaling relay connection is up.
    SignalingConnected,
    /// The signaling relay connection dropped.
    SignalingDisconnected,
    /// A signaling reconnect attempt is scheduled.
    SignalingReconnecting,
    /// Reconnect attempts are exhausted; signaling is down for good.
    SignalingUnavailable,
}

/// One entry in the notice stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerNotice {
    /// What happened.
    pub kind: NoticeKind,
    /// The peer concerned, if any.
    pub peer: Option<PeerId>,
    /// Human-readable detail (error text, attempt number).
    pub detail: Option<String>,
}

/// Cloneable sending half of the notice stream.
///
/// Sends never block: if the consumer falls behind, notices are dropped.
#[derive(Debug, Clone)]
pub struct NoticeSender {
    tx: mpsc::Sender<PeerNotice>,
}

impl NoticeSender {
    /// Create a notice stream with room for `buffer` undelivered notices.
    #[must_use]
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<PeerNotice>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }

    /// Emit a notice.
    pub fn emit(&self, kind: NoticeKind, peer: Option<&PeerId>, detail: Option<String>) {
        let _ = self.tx.try_send(PeerNotice {
            kind,
            peer: peer.cloned(),
            detail,
        });
    }

    /// Emit a notice about `peer` without detail.
    pub fn peer(&self, kind: NoticeKind, peer: &PeerId) {
        self.emit(kind, Some(peer), None);
    }
}
