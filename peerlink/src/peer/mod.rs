//! Peer connection manager.
//!
//! Owns at most one connection per remote peer, drives offer/answer/candidate
//! negotiation through a [`SignalSender`], and folds backend events into
//! per-peer state. It never decides *when* to connect or recover: it reports
//! [`PeerUpdate`]s and the service layer reacts.

pub mod channel;
pub mod recovery;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;

use peerlink_proto::message::PeerId;
use peerlink_proto::signal::{IceCandidate, SessionDescription, SignalMessage};

use crate::config::PeerConfig;
use crate::notice::{NoticeKind, NoticeSender};
use crate::rtc::{
    ChannelState, ConnectionState, PeerRtcEvent, RtcBackend, RtcConnection, RtcError, RtcEvent,
    RtcEventSink,
};
use crate::signal::{SignalSender, SignalingError};

use channel::{ChannelDirection, ChannelSet};
use recovery::{RecoveryAction, RecoveryPhase};

/// Errors from connection management.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// The RTC backend rejected an operation.
    #[error("rtc error: {0}")]
    Rtc(#[from] RtcError),

    /// A negotiation frame could not be signaled.
    #[error("signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// No connection exists for the peer.
    #[error("no connection to peer {0}")]
    NoConnection(PeerId),

    /// The connection exists but has no open data channel.
    #[error("no open data channel to peer {0}")]
    NoOpenChannel(PeerId),
}

/// What the service needs to react to after applying a backend event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerUpdate {
    /// The connection changed state.
    State {
        /// The remote peer.
        peer: PeerId,
        /// New state.
        state: ConnectionState,
        /// Recovery step to take, if any.
        action: Option<RecoveryAction>,
    },
    /// A data channel to the peer opened.
    ChannelOpen {
        /// The remote peer.
        peer: PeerId,
    },
    /// A data channel to the peer closed.
    ChannelClosed {
        /// The remote peer.
        peer: PeerId,
    },
    /// A data channel to the peer reported an error.
    ChannelError {
        /// The remote peer.
        peer: PeerId,
        /// Backend error text.
        error: String,
    },
    /// A text frame arrived from the peer.
    Message {
        /// The remote peer the channel belongs to.
        peer: PeerId,
        /// The raw frame.
        data: String,
    },
}

/// Snapshot of one connection, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Current state.
    pub state: ConnectionState,
    /// Generation of the live connection object.
    pub generation: u64,
    /// Recovery phase.
    pub phase: RecoveryPhase,
    /// Number of open channels.
    pub open_channels: usize,
}

struct PeerEntry<C> {
    conn: Arc<C>,
    generation: u64,
    state: ConnectionState,
    phase: RecoveryPhase,
    channels: ChannelSet,
    /// Start of the current negotiation window.
    since: Instant,
}

/// Manages peer connections for the local peer.
pub struct PeerConnectionManager<B: RtcBackend, S: SignalSender> {
    local_id: PeerId,
    backend: B,
    signaling: Arc<S>,
    config: PeerConfig,
    connections: Mutex<HashMap<PeerId, PeerEntry<B::Connection>>>,
    next_generation: AtomicU64,
    rtc_tx: mpsc::UnboundedSender<PeerRtcEvent>,
    notices: NoticeSender,
}

impl<B: RtcBackend, S: SignalSender> PeerConnectionManager<B, S> {
    /// Creates a manager.
    ///
    /// Returns the manager and the receiver on which every backend event
    /// arrives; feed those back through [`apply_event`](Self::apply_event).
    pub fn new(
        local_id: PeerId,
        backend: B,
        signaling: Arc<S>,
        config: PeerConfig,
        notices: NoticeSender,
    ) -> (Self, mpsc::UnboundedReceiver<PeerRtcEvent>) {
        let (rtc_tx, rtc_rx) = mpsc::unbounded_channel();
        let manager = Self {
            local_id,
            backend,
            signaling,
            config,
            connections: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            rtc_tx,
            notices,
        };
        (manager, rtc_rx)
    }

    /// The local peer identity.
    pub const fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Return the existing connection to `peer` or create one with an
    /// ordered outbound data channel.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Rtc`] if the backend cannot create the
    /// connection or its channel.
    pub async fn get_or_create(&self, peer: &PeerId) -> Result<Arc<B::Connection>, PeerError> {
        let mut connections = self.connections.lock().await;
        if let Some(entry) = connections.get(peer) {
            return Ok(Arc::clone(&entry.conn));
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let sink = RtcEventSink::new(peer.clone(), generation, self.rtc_tx.clone());
        let conn = self.backend.create_connection(peer, sink).await?;
        let channel = match conn.create_data_channel(&self.config.channel_label).await {
            Ok(channel) => channel,
            Err(e) => {
                conn.close().await;
                return Err(e.into());
            }
        };

        let mut channels = ChannelSet::default();
        channels.add(channel, self.config.channel_label.clone(), ChannelDirection::Outbound);
        let conn = Arc::new(conn);
        connections.insert(
            peer.clone(),
            PeerEntry {
                conn: Arc::clone(&conn),
                generation,
                state: ConnectionState::New,
                phase: RecoveryPhase::Stable,
                channels,
                since: Instant::now(),
            },
        );
        drop(connections);

        tracing::info!(peer = %peer, generation, "peer connection created");
        self.notices.peer(NoticeKind::ConnectionCreated, peer);
        Ok(conn)
    }

    /// Start (or restart) negotiation with `peer` by sending an offer.
    ///
    /// # Errors
    ///
    /// Returns the first backend or signaling error; a
    /// [`NoticeKind::NegotiationFailed`] notice is emitted as well.
    pub async fn initiate(&self, peer: &PeerId, ice_restart: bool) -> Result<(), PeerError> {
        let result: Result<(), PeerError> = async {
            let conn = self.get_or_create(peer).await?;
            let offer = conn.create_offer(ice_restart).await?;
            conn.set_local_description(offer.clone()).await?;
            self.signaling
                .send(SignalMessage::Offer {
                    offer,
                    recipient_id: peer.clone(),
                    sender_id: self.local_id.clone(),
                })
                .await?;
            Ok(())
        }
        .await;

        match &result {
            Ok(()) => tracing::debug!(peer = %peer, ice_restart, "offer sent"),
            Err(e) => self.negotiation_failed(peer, "offer", e),
        }
        result
    }

    /// Answer an offer from `from`, creating the connection if needed.
    ///
    /// # Errors
    ///
    /// Returns the first backend or signaling error.
    pub async fn handle_offer(
        &self,
        from: &PeerId,
        offer: SessionDescription,
    ) -> Result<SessionDescription, PeerError> {
        let result: Result<SessionDescription, PeerError> = async {
            let conn = self.get_or_create(from).await?;
            conn.set_remote_description(offer).await?;
            let answer = conn.create_answer().await?;
            conn.set_local_description(answer.clone()).await?;
            self.signaling
                .send(SignalMessage::Answer {
                    answer: answer.clone(),
                    recipient_id: from.clone(),
                    sender_id: self.local_id.clone(),
                })
                .await?;
            Ok(answer)
        }
        .await;

        match &result {
            Ok(_) => tracing::debug!(peer = %from, "answer sent"),
            Err(e) => self.negotiation_failed(from, "answer", e),
        }
        result
    }

    /// Apply an answer from `from`. Ignored if no connection exists.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Rtc`] if the backend rejects the answer.
    pub async fn handle_answer(
        &self,
        from: &PeerId,
        answer: SessionDescription,
    ) -> Result<(), PeerError> {
        let Some(conn) = self.connection(from).await else {
            tracing::debug!(peer = %from, "answer for unknown connection, ignoring");
            return Ok(());
        };
        conn.set_remote_description(answer).await.map_err(|e| {
            let e = PeerError::from(e);
            self.negotiation_failed(from, "remote answer", &e);
            e
        })
    }

    /// Add a trickled candidate from `from`. Ignored if no connection exists.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Rtc`] if the backend rejects the candidate.
    pub async fn handle_ice_candidate(
        &self,
        from: &PeerId,
        candidate: IceCandidate,
    ) -> Result<(), PeerError> {
        let Some(conn) = self.connection(from).await else {
            tracing::debug!(peer = %from, "candidate for unknown connection, ignoring");
            return Ok(());
        };
        conn.add_ice_candidate(candidate).await.map_err(|e| {
            tracing::warn!(peer = %from, error = %e, "failed to add ICE candidate");
            PeerError::from(e)
        })
    }

    /// Fold a backend event into connection state.
    ///
    /// Events from replaced connections are dropped. Local ICE candidates
    /// are signaled here and produce no update.
    pub async fn apply_event(&self, event: PeerRtcEvent) -> Option<PeerUpdate> {
        let PeerRtcEvent {
            peer,
            generation,
            event,
        } = event;

        let mut connections = self.connections.lock().await;
        let Some(entry) = connections
            .get_mut(&peer)
            .filter(|e| e.generation == generation)
        else {
            tracing::trace!(peer = %peer, generation, "dropping event from stale connection");
            return None;
        };

        match event {
            RtcEvent::IceCandidate(candidate) => {
                drop(connections);
                let frame = SignalMessage::IceCandidate {
                    candidate,
                    recipient_id: peer.clone(),
                    sender_id: self.local_id.clone(),
                };
                if let Err(e) = self.signaling.send(frame).await {
                    tracing::warn!(peer = %peer, error = %e, "failed to signal ICE candidate");
                }
                None
            }
            RtcEvent::StateChanged(state) => {
                let (phase, action) = recovery::next(entry.phase, state);
                entry.state = state;
                entry.phase = phase;
                if matches!(
                    state,
                    ConnectionState::Connecting
                        | ConnectionState::Disconnected
                        | ConnectionState::Failed
                ) {
                    entry.since = Instant::now();
                }
                drop(connections);
                tracing::info!(peer = %peer, state = %state, "peer connection state changed");
                self.notices.emit(
                    NoticeKind::StateChanged(state),
                    Some(&peer),
                    Some(state.to_string()),
                );
                Some(PeerUpdate::State {
                    peer,
                    state,
                    action,
                })
            }
            RtcEvent::ChannelCreated { channel, label } => {
                tracing::debug!(peer = %peer, channel = %channel, label = %label, "remote data channel");
                entry.channels.add(channel, label, ChannelDirection::Inbound);
                None
            }
            RtcEvent::ChannelOpen(channel) => {
                entry.channels.set_state(channel, ChannelState::Open);
                drop(connections);
                tracing::info!(peer = %peer, channel = %channel, "data channel open");
                self.notices.peer(NoticeKind::ChannelOpen, &peer);
                Some(PeerUpdate::ChannelOpen { peer })
            }
            RtcEvent::ChannelClosed(channel) => {
                entry.channels.set_state(channel, ChannelState::Closed);
                drop(connections);
                tracing::info!(peer = %peer, channel = %channel, "data channel closed");
                self.notices.peer(NoticeKind::ChannelClosed, &peer);
                Some(PeerUpdate::ChannelClosed { peer })
            }
            RtcEvent::ChannelError { channel, error } => {
                drop(connections);
                tracing::warn!(peer = %peer, channel = %channel, error = %error, "data channel error");
                self.notices
                    .emit(NoticeKind::ChannelError, Some(&peer), Some(error.clone()));
                Some(PeerUpdate::ChannelError { peer, error })
            }
            RtcEvent::ChannelMessage { data, .. } => Some(PeerUpdate::Message { peer, data }),
        }
    }

    /// Send a raw frame on the first open channel to `peer`.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::NoConnection`] or [`PeerError::NoOpenChannel`]
    /// when there is nothing to send on, or the backend's send error.
    pub async fn send_on_channel(&self, peer: &PeerId, data: String) -> Result<(), PeerError> {
        let (conn, channel) = {
            let connections = self.connections.lock().await;
            let entry = connections
                .get(peer)
                .ok_or_else(|| PeerError::NoConnection(peer.clone()))?;
            let channel = entry
                .channels
                .first_open()
                .ok_or_else(|| PeerError::NoOpenChannel(peer.clone()))?;
            (Arc::clone(&entry.conn), channel)
        };
        conn.send(channel, data).await?;
        Ok(())
    }

    /// Whether a data channel to `peer` is open.
    pub async fn has_open_channel(&self, peer: &PeerId) -> bool {
        self.connections
            .lock()
            .await
            .get(peer)
            .is_some_and(|e| e.channels.has_open())
    }

    /// Whether a connection object exists for `peer`.
    pub async fn has_connection(&self, peer: &PeerId) -> bool {
        self.connections.lock().await.contains_key(peer)
    }

    /// Current state of the connection to `peer`.
    pub async fn state(&self, peer: &PeerId) -> Option<ConnectionState> {
        self.connections.lock().await.get(peer).map(|e| e.state)
    }

    /// Diagnostic snapshot of the connection to `peer`.
    pub async fn info(&self, peer: &PeerId) -> Option<ConnectionInfo> {
        self.connections.lock().await.get(peer).map(|e| ConnectionInfo {
            state: e.state,
            generation: e.generation,
            phase: e.phase,
            open_channels: e.channels.open_count(),
        })
    }

    /// Peers with a connection object.
    pub async fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.connections.lock().await.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Close and forget the connection to `peer`. Closing an unknown peer
    /// does nothing.
    pub async fn close(&self, peer: &PeerId) {
        let entry = self.connections.lock().await.remove(peer);
        if let Some(entry) = entry {
            entry.conn.close().await;
            tracing::info!(peer = %peer, generation = entry.generation, "peer connection closed");
        }
    }

    /// Close every connection.
    pub async fn close_all(&self) {
        let entries: Vec<_> = self.connections.lock().await.drain().collect();
        for (peer, entry) in entries {
            entry.conn.close().await;
            tracing::debug!(peer = %peer, "peer connection closed");
        }
    }

    /// Peers whose negotiation has been pending for at least `timeout`.
    ///
    /// A `Disconnected` connection that has not recovered within `timeout`
    /// counts as stalled, as does an ICE restart that has not moved the
    /// connection out of `Failed`.
    pub async fn stalled(&self, timeout: Duration) -> Vec<PeerId> {
        let now = Instant::now();
        self.connections
            .lock()
            .await
            .iter()
            .filter(|(_, e)| {
                let pending = match e.state {
                    ConnectionState::New
                    | ConnectionState::Connecting
                    | ConnectionState::Disconnected => true,
                    ConnectionState::Failed => e.phase == RecoveryPhase::Restarting,
                    _ => false,
                };
                pending && now.duration_since(e.since) >= timeout
            })
            .map(|(peer, _)| peer.clone())
            .collect()
    }

    /// Treat the connection to `peer` as failed and advance its recovery
    /// cycle. Returns the recovery step to take.
    pub async fn report_failure(&self, peer: &PeerId) -> Option<RecoveryAction> {
        let mut connections = self.connections.lock().await;
        let entry = connections.get_mut(peer)?;
        let (phase, action) = recovery::next(entry.phase, ConnectionState::Failed);
        entry.phase = phase;
        entry.state = ConnectionState::Failed;
        entry.since = Instant::now();
        drop(connections);
        tracing::warn!(peer = %peer, ?action, "peer connection treated as failed");
        action
    }

    async fn connection(&self, peer: &PeerId) -> Option<Arc<B::Connection>> {
        self.connections
            .lock()
            .await
            .get(peer)
            .map(|e| Arc::clone(&e.conn))
    }

    fn negotiation_failed(&self, peer: &PeerId, step: &str, error: &PeerError) {
        tracing::warn!(peer = %peer, step, error = %error, "negotiation failed");
        self.notices
            .emit(NoticeKind::NegotiationFailed, Some(peer), Some(error.to_string()));
    }
}
