//! Abstraction over the WebRTC engine.
//!
//! The peer connection manager drives connections through the
//! [`RtcBackend`] and [`RtcConnection`] traits and learns about everything
//! asynchronous (ICE candidates, state changes, channel lifecycle, inbound
//! data) from [`PeerRtcEvent`]s pushed into one shared event stream.
//! Implementations:
//! - [`loopback::LoopbackNetwork`]: in-process simulation for tests
//! - `webrtc::WebRtcBackend`: the `webrtc` crate (feature `webrtc`)

pub mod loopback;
#[cfg(feature = "webrtc")]
pub mod webrtc;

use std::fmt;

use tokio::sync::mpsc;

use peerlink_proto::message::PeerId;
use peerlink_proto::signal::{IceCandidate, SessionDescription};

/// Lifecycle of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Created, negotiation not started.
    New,
    /// Negotiating or running ICE checks.
    Connecting,
    /// Media transport is up.
    Connected,
    /// Transport was lost; may recover on its own.
    Disconnected,
    /// ICE failed; needs a restart or a new connection.
    Failed,
    /// Closed locally.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Lifecycle of a data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// Created, not yet usable.
    Connecting,
    /// Ready to send and receive.
    Open,
    /// Shutting down.
    Closing,
    /// Closed for good.
    Closed,
}

/// Backend-assigned handle for a data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

/// Something asynchronous happened on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcEvent {
    /// A local ICE candidate was gathered and must be signaled.
    IceCandidate(IceCandidate),
    /// The connection changed state.
    StateChanged(ConnectionState),
    /// The remote side opened a channel towards us.
    ChannelCreated {
        /// Handle for the new channel.
        channel: ChannelId,
        /// Label chosen by the remote side.
        label: String,
    },
    /// A channel became usable.
    ChannelOpen(ChannelId),
    /// A channel closed.
    ChannelClosed(ChannelId),
    /// A channel reported an error.
    ChannelError {
        /// The failing channel.
        channel: ChannelId,
        /// Backend error text.
        error: String,
    },
    /// A text frame arrived on a channel.
    ChannelMessage {
        /// The receiving channel.
        channel: ChannelId,
        /// The frame.
        data: String,
    },
}

/// An [`RtcEvent`] tagged with the connection it came from.
///
/// `generation` distinguishes a recreated connection from the one it
/// replaced, so late events from a torn-down connection can be ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRtcEvent {
    /// The remote peer.
    pub peer: PeerId,
    /// Connection generation the event belongs to.
    pub generation: u64,
    /// What happened.
    pub event: RtcEvent,
}

/// Handle a backend uses to report events for one connection.
#[derive(Debug, Clone)]
pub struct RtcEventSink {
    peer: PeerId,
    generation: u64,
    tx: mpsc::UnboundedSender<PeerRtcEvent>,
}

impl RtcEventSink {
    /// Creates a sink that tags events with `peer` and `generation`.
    #[must_use]
    pub const fn new(
        peer: PeerId,
        generation: u64,
        tx: mpsc::UnboundedSender<PeerRtcEvent>,
    ) -> Self {
        Self {
            peer,
            generation,
            tx,
        }
    }

    /// Report an event. Silently dropped once the manager is gone.
    pub fn emit(&self, event: RtcEvent) {
        let _ = self.tx.send(PeerRtcEvent {
            peer: self.peer.clone(),
            generation: self.generation,
            event,
        });
    }

    /// The peer this sink reports for.
    #[must_use]
    pub const fn peer(&self) -> &PeerId {
        &self.peer
    }
}

/// Errors returned by RTC backends.
#[derive(Debug, thiserror::Error)]
pub enum RtcError {
    /// Offer/answer or candidate handling was rejected.
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// The channel exists but is not open.
    #[error("data channel {0} is not open")]
    ChannelNotOpen(ChannelId),

    /// No channel with this id belongs to the connection.
    #[error("unknown data channel {0}")]
    UnknownChannel(ChannelId),

    /// The connection has been closed.
    #[error("connection closed")]
    Closed,

    /// Any other backend failure.
    #[error("rtc backend error: {0}")]
    Backend(String),
}

/// Factory for peer connections.
pub trait RtcBackend: Send + Sync + 'static {
    /// The connection type this backend produces.
    type Connection: RtcConnection;

    /// Create a connection to `peer` that reports through `events`.
    ///
    /// # Errors
    ///
    /// Returns [`RtcError::Backend`] if the engine cannot create one.
    fn create_connection(
        &self,
        peer: &PeerId,
        events: RtcEventSink,
    ) -> impl std::future::Future<Output = Result<Self::Connection, RtcError>> + Send;
}

/// One peer connection.
///
/// Data channels are always ordered and reliable.
pub trait RtcConnection: Send + Sync + 'static {
    /// Create an offer, optionally requesting an ICE restart.
    fn create_offer(
        &self,
        ice_restart: bool,
    ) -> impl std::future::Future<Output = Result<SessionDescription, RtcError>> + Send;

    /// Create an answer to the applied remote offer.
    fn create_answer(
        &self,
    ) -> impl std::future::Future<Output = Result<SessionDescription, RtcError>> + Send;

    /// Apply a locally created description.
    fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> impl std::future::Future<Output = Result<(), RtcError>> + Send;

    /// Apply the remote side's description.
    fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> impl std::future::Future<Output = Result<(), RtcError>> + Send;

    /// Add a trickled remote candidate.
    fn add_ice_candidate(
        &self,
        candidate: IceCandidate,
    ) -> impl std::future::Future<Output = Result<(), RtcError>> + Send;

    /// Create an outbound ordered channel.
    fn create_data_channel(
        &self,
        label: &str,
    ) -> impl std::future::Future<Output = Result<ChannelId, RtcError>> + Send;

    /// Send a text frame on an open channel.
    fn send(
        &self,
        channel: ChannelId,
        data: String,
    ) -> impl std::future::Future<Output = Result<(), RtcError>> + Send;

    /// Close the connection and all its channels.
    fn close(&self) -> impl std::future::Future<Output = ()> + Send;
}
