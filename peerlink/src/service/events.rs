//! Event handling for [`PeerService`]: backend events, signaling events,
//! presence changes and connection recovery.

use std::sync::Arc;

use peerlink_proto::message::{Message, MessageBody, PeerId, Recipient};
use peerlink_proto::presence::PresenceStatus;

use crate::notice::NoticeKind;
use crate::peer::PeerUpdate;
use crate::peer::recovery::RecoveryAction;
use crate::rtc::{PeerRtcEvent, RtcBackend};
use crate::signal::{SignalSender, SignalingEvent};
use crate::store::ExternalStore;

use super::PeerService;

impl<B: RtcBackend, S: SignalSender, St: ExternalStore> PeerService<B, S, St> {
    pub(super) async fn on_rtc_event(self: &Arc<Self>, event: PeerRtcEvent) {
        let Some(update) = self.manager.apply_event(event).await else {
            return;
        };
        match update {
            PeerUpdate::State {
                peer,
                action: Some(action),
                ..
            } => self.run_recovery(peer, action).await,
            PeerUpdate::ChannelOpen { peer } => self.flush_pending(&peer).await,
            PeerUpdate::Message { peer, data } => self.receive_frame(&peer, &data).await,
            PeerUpdate::State { action: None, .. }
            | PeerUpdate::ChannelClosed { .. }
            | PeerUpdate::ChannelError { .. } => {}
        }
    }

    pub(super) async fn on_signal_event(self: &Arc<Self>, event: SignalingEvent) {
        match event {
            SignalingEvent::Offer { from, offer } => {
                let _ = self.manager.handle_offer(&from, offer).await;
            }
            SignalingEvent::Answer { from, answer } => {
                let _ = self.manager.handle_answer(&from, answer).await;
            }
            SignalingEvent::IceCandidate { from, candidate } => {
                let _ = self.manager.handle_ice_candidate(&from, candidate).await;
            }
            SignalingEvent::PresenceChanged {
                peer: Some(peer),
                status,
                ..
            } => self.on_presence(peer, status).await,
            SignalingEvent::PresenceChanged {
                peer: None, user, ..
            } => {
                tracing::debug!(user = ?user, "presence change without peer id, ignoring");
            }
            SignalingEvent::Connected => {
                self.notices.emit(NoticeKind::SignalingConnected, None, None);
            }
            SignalingEvent::Disconnected => {
                self.notices
                    .emit(NoticeKind::SignalingDisconnected, None, None);
            }
            SignalingEvent::Reconnecting { attempt, delay } => self.notices.emit(
                NoticeKind::SignalingReconnecting,
                None,
                Some(format!("attempt {attempt} in {}ms", delay.as_millis())),
            ),
            SignalingEvent::Unavailable { attempts } => {
                tracing::error!(attempts, "signaling unavailable, peer connections left as they are");
                self.notices.emit(
                    NoticeKind::SignalingUnavailable,
                    None,
                    Some(format!("gave up after {attempts} attempts")),
                );
            }
            SignalingEvent::Error(error) => {
                tracing::warn!(error = %error, "signaling error");
            }
        }
    }

    /// Record a presence change and tell subscribers about it.
    ///
    /// A peer coming online with queued messages gets them flushed, or a
    /// fresh negotiation if no channel is open.
    async fn on_presence(&self, peer: PeerId, status: PresenceStatus) {
        if peer == self.local_id {
            return;
        }
        let changed = self.presence.apply(&peer, status);
        tracing::info!(peer = %peer, status = ?status, changed, "peer presence");

        let (kind, body) = match status {
            PresenceStatus::Online => (
                NoticeKind::PeerOnline,
                MessageBody::PeerConnected {
                    peer_id: peer.clone(),
                },
            ),
            PresenceStatus::Offline => (
                NoticeKind::PeerOffline,
                MessageBody::PeerDisconnected {
                    peer_id: peer.clone(),
                },
            ),
        };
        self.notices.peer(kind, &peer);
        self.batcher.push(Message::new(
            peer.clone(),
            Recipient::Peer(self.local_id.clone()),
            body,
        ));

        if status == PresenceStatus::Online && !self.pending.is_empty(&peer) {
            if self.manager.has_open_channel(&peer).await {
                self.flush_pending(&peer).await;
            } else {
                let _ = self.manager.initiate(&peer, false).await;
            }
        }
    }

    /// Take the recovery step chosen for a failed connection.
    pub(super) async fn run_recovery(self: &Arc<Self>, peer: PeerId, action: RecoveryAction) {
        match action {
            RecoveryAction::IceRestart => {
                tracing::info!(peer = %peer, "restarting ICE");
                self.notices.peer(NoticeKind::IceRestart, &peer);
                let _ = self.manager.initiate(&peer, true).await;
            }
            RecoveryAction::Recreate => {
                tracing::info!(peer = %peer, delay_ms = self.peer_config.recreate_delay.as_millis(), "recreating connection");
                self.notices.peer(NoticeKind::Recreating, &peer);
                self.manager.close(&peer).await;
                if self.presence.is_offline(&peer) {
                    tracing::debug!(peer = %peer, "peer offline, not recreating");
                    return;
                }

                let this = Arc::clone(self);
                let target = peer.clone();
                let delay = self.peer_config.recreate_delay;
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    this.recreations.lock().remove(&target);
                    let _ = this.manager.initiate(&target, false).await;
                });
                if let Some(previous) = self.recreations.lock().insert(peer, handle) {
                    previous.abort();
                }
            }
        }
    }
}
