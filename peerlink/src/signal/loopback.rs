//! In-process signaling relay for tests.
//!
//! [`LoopbackSignalHub`] behaves like the WebSocket relay: it routes
//! offer/answer/candidate frames by recipient (overwriting the sender with
//! the joined identity), drops frames for absent peers, and broadcasts
//! presence when peers join, drop or leave.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use peerlink_proto::message::{PeerId, UserId};
use peerlink_proto::presence::PresenceStatus;
use peerlink_proto::signal::SignalMessage;

use super::{SignalSender, SignalingError, SignalingEvent, event_from_message};

struct HubPeer {
    user: Option<UserId>,
    tx: mpsc::Sender<SignalingEvent>,
    online: bool,
}

#[derive(Default)]
struct HubInner {
    peers: HashMap<PeerId, HubPeer>,
    routed: Vec<SignalMessage>,
}

impl HubInner {
    fn presence(&self, peer: &PeerId, status: PresenceStatus) -> SignalingEvent {
        SignalingEvent::PresenceChanged {
            peer: Some(peer.clone()),
            user: self.peers.get(peer).and_then(|p| p.user.clone()),
            status,
        }
    }

    /// Tell every other online peer about `peer`'s new status.
    fn broadcast(&self, peer: &PeerId, status: PresenceStatus) {
        let event = self.presence(peer, status);
        for (id, entry) in &self.peers {
            if id != peer && entry.online {
                let _ = entry.tx.try_send(event.clone());
            }
        }
    }

    /// Announce `peer` as connected and tell it who else is online.
    fn bring_online(&mut self, peer: &PeerId) {
        let Some(entry) = self.peers.get_mut(peer) else {
            return;
        };
        entry.online = true;
        let _ = entry.tx.try_send(SignalingEvent::Connected);

        let others: Vec<SignalingEvent> = self
            .peers
            .iter()
            .filter(|(id, p)| *id != peer && p.online)
            .map(|(id, _)| self.presence(id, PresenceStatus::Online))
            .collect();
        if let Some(entry) = self.peers.get(peer) {
            for event in others {
                let _ = entry.tx.try_send(event);
            }
        }
        self.broadcast(peer, PresenceStatus::Online);
    }
}

/// Shared in-process relay.
#[derive(Clone, Default)]
pub struct LoopbackSignalHub {
    inner: Arc<Mutex<HubInner>>,
}

impl LoopbackSignalHub {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the hub as `peer`.
    ///
    /// The returned receiver first sees [`SignalingEvent::Connected`], then
    /// an online notice for every peer already present.
    pub fn join(
        &self,
        peer: PeerId,
        user: Option<UserId>,
        buffer: usize,
    ) -> (LoopbackSignaling, mpsc::Receiver<SignalingEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        {
            let mut inner = self.inner.lock();
            inner.peers.insert(
                peer.clone(),
                HubPeer {
                    user,
                    tx,
                    online: false,
                },
            );
            inner.bring_online(&peer);
        }
        tracing::debug!(peer = %peer, "joined loopback signaling hub");
        (
            LoopbackSignaling {
                local_id: peer,
                hub: Arc::clone(&self.inner),
            },
            rx,
        )
    }

    /// Simulate the relay connection of `peer` dropping.
    pub fn disconnect(&self, peer: &PeerId) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.peers.get_mut(peer) {
            if !entry.online {
                return;
            }
            entry.online = false;
            let _ = entry.tx.try_send(SignalingEvent::Disconnected);
        }
        inner.broadcast(peer, PresenceStatus::Offline);
    }

    /// Bring a disconnected `peer` back.
    pub fn reconnect(&self, peer: &PeerId) {
        self.inner.lock().bring_online(peer);
    }

    /// Remove `peer` from the hub for good.
    pub fn leave(&self, peer: &PeerId) {
        let mut inner = self.inner.lock();
        let was_online = inner.peers.get(peer).is_some_and(|p| p.online);
        if was_online {
            inner.broadcast(peer, PresenceStatus::Offline);
        }
        inner.peers.remove(peer);
    }

    /// Whether `peer` is currently connected to the hub.
    #[must_use]
    pub fn is_online(&self, peer: &PeerId) -> bool {
        self.inner.lock().peers.get(peer).is_some_and(|p| p.online)
    }

    /// Every frame the hub has delivered, in order.
    #[must_use]
    pub fn routed(&self) -> Vec<SignalMessage> {
        self.inner.lock().routed.clone()
    }

    /// Number of delivered frames of the given type (see
    /// [`SignalMessage::type_name`]).
    #[must_use]
    pub fn routed_count(&self, type_name: &str) -> usize {
        self.inner
            .lock()
            .routed
            .iter()
            .filter(|m| m.type_name() == type_name)
            .count()
    }
}

/// One peer's handle on a [`LoopbackSignalHub`].
pub struct LoopbackSignaling {
    local_id: PeerId,
    hub: Arc<Mutex<HubInner>>,
}

impl SignalSender for LoopbackSignaling {
    async fn send(&self, message: SignalMessage) -> Result<(), SignalingError> {
        let mut inner = self.hub.lock();
        if !inner.peers.get(&self.local_id).is_some_and(|p| p.online) {
            return Err(SignalingError::NotConnected);
        }

        let Some(recipient) = message.recipient().cloned() else {
            tracing::debug!(kind = message.type_name(), "loopback hub ignores unrouted frame");
            return Ok(());
        };
        let message = message.with_sender(self.local_id.clone());

        let Some(target) = inner.peers.get(&recipient).filter(|p| p.online) else {
            tracing::debug!(
                recipient = %recipient,
                kind = message.type_name(),
                "recipient not connected, dropping signaling frame"
            );
            return Ok(());
        };

        let tx = target.tx.clone();
        inner.routed.push(message.clone());
        if let Some(event) = event_from_message(&recipient, message) {
            let _ = tx.try_send(event);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.hub
            .lock()
            .peers
            .get(&self.local_id)
            .is_some_and(|p| p.online)
    }

    fn local_id(&self) -> &PeerId {
        &self.local_id
    }
}
