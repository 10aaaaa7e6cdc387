//! In-process RTC simulation for tests.
//!
//! A [`LoopbackNetwork`] hands out one [`LoopbackBackend`] per simulated
//! peer. Connections "negotiate" by exchanging descriptions that name their
//! endpoint; once two endpoints hold each other's descriptions they link,
//! report `connected`, and every locally created channel is mirrored on the
//! other side and opened. Links between two peers can be cut with
//! [`LoopbackNetwork::set_link`] to exercise failure recovery.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use peerlink_proto::message::PeerId;
use peerlink_proto::signal::{IceCandidate, SdpKind, SessionDescription};

use super::{
    ChannelId, ConnectionState, RtcBackend, RtcConnection, RtcError, RtcEvent, RtcEventSink,
};

struct Channel {
    id: ChannelId,
    label: String,
    /// Created by the remote side.
    inbound: bool,
    /// Counterpart on the linked endpoint while linked.
    mirror: Option<ChannelId>,
    open: bool,
}

struct Endpoint {
    owner: PeerId,
    remote: PeerId,
    sink: RtcEventSink,
    state: ConnectionState,
    local_desc: Option<SessionDescription>,
    remote_desc: Option<SessionDescription>,
    linked: Option<u64>,
    channels: Vec<Channel>,
}

impl Endpoint {
    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            self.state = state;
            self.sink.emit(RtcEvent::StateChanged(state));
        }
    }
}

#[derive(Default)]
struct NetInner {
    endpoints: HashMap<u64, Endpoint>,
    next_endpoint: u64,
    next_channel: u64,
    down: HashSet<(PeerId, PeerId)>,
    created: usize,
}

fn link_key(a: &PeerId, b: &PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

/// Extract the endpoint id from a loopback description.
fn endpoint_of(description: &SessionDescription) -> Option<u64> {
    description
        .sdp
        .split_whitespace()
        .find_map(|field| field.strip_prefix("ep="))
        .and_then(|id| id.parse().ok())
}

impl NetInner {
    fn channel_id(&mut self) -> ChannelId {
        self.next_channel += 1;
        ChannelId(self.next_channel)
    }

    /// Link `id` with the endpoint its remote description names, if both
    /// sides have finished negotiating.
    fn try_link(&mut self, id: u64) {
        let Some(endpoint) = self.endpoints.get(&id) else {
            return;
        };
        if endpoint.local_desc.is_none() {
            return;
        }
        let Some(other_id) = endpoint.remote_desc.as_ref().and_then(endpoint_of) else {
            return;
        };
        if endpoint.linked == Some(other_id) {
            return;
        }
        let Some(other) = self.endpoints.get(&other_id) else {
            return;
        };
        if other.local_desc.is_none()
            || other.remote_desc.as_ref().and_then(endpoint_of) != Some(id)
        {
            return;
        }

        let key = link_key(&endpoint.owner, &other.owner);
        let relink = [
            (id, endpoint.linked.is_some()),
            (other_id, other.linked.is_some()),
        ];
        if self.down.contains(&key) {
            for ep in [id, other_id] {
                if let Some(e) = self.endpoints.get_mut(&ep) {
                    e.set_state(ConnectionState::Failed);
                }
            }
            return;
        }

        for (ep, linked) in relink {
            if linked {
                self.unlink(ep, false);
            }
        }
        self.link(id, other_id);
    }

    fn link(&mut self, a: u64, b: u64) {
        for (this, that) in [(a, b), (b, a)] {
            if let Some(e) = self.endpoints.get_mut(&this) {
                e.linked = Some(that);
                e.set_state(ConnectionState::Connected);
            }
        }
        self.mirror_channels(a, b);
        self.mirror_channels(b, a);
    }

    /// Mirror every unmirrored outbound channel of `from` onto `to` and open
    /// both ends.
    fn mirror_channels(&mut self, from: u64, to: u64) {
        let pending: Vec<(ChannelId, String)> = self
            .endpoints
            .get(&from)
            .map(|e| {
                e.channels
                    .iter()
                    .filter(|c| !c.inbound && c.mirror.is_none())
                    .map(|c| (c.id, c.label.clone()))
                    .collect()
            })
            .unwrap_or_default();

        for (local, label) in pending {
            let mirror = self.channel_id();
            if let Some(e) = self.endpoints.get_mut(&to) {
                e.channels.push(Channel {
                    id: mirror,
                    label: label.clone(),
                    inbound: true,
                    mirror: Some(local),
                    open: true,
                });
                e.sink.emit(RtcEvent::ChannelCreated {
                    channel: mirror,
                    label,
                });
                e.sink.emit(RtcEvent::ChannelOpen(mirror));
            }
            if let Some(e) = self.endpoints.get_mut(&from)
                && let Some(channel) = e.channels.iter_mut().find(|c| c.id == local)
            {
                channel.mirror = Some(mirror);
                channel.open = true;
                e.sink.emit(RtcEvent::ChannelOpen(local));
            }
        }
    }

    /// Break the link of `id` (and its partner), closing all channels.
    fn unlink(&mut self, id: u64, partner_disconnects: bool) {
        let partner = self.endpoints.get(&id).and_then(|e| e.linked);
        for (ep, disconnected) in [(Some(id), false), (partner, partner_disconnects)] {
            let Some(e) = ep.and_then(|ep| self.endpoints.get_mut(&ep)) else {
                continue;
            };
            e.linked = None;
            for channel in &e.channels {
                if channel.open {
                    e.sink.emit(RtcEvent::ChannelClosed(channel.id));
                }
            }
            e.channels.retain(|c| !c.inbound);
            for channel in &mut e.channels {
                channel.open = false;
                channel.mirror = None;
            }
            if disconnected {
                e.set_state(ConnectionState::Disconnected);
            }
        }
    }
}

/// Shared simulated network.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<NetInner>>,
}

impl LoopbackNetwork {
    /// Creates an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend whose connections belong to `owner`.
    #[must_use]
    pub fn backend(&self, owner: PeerId) -> LoopbackBackend {
        LoopbackBackend {
            owner,
            net: Arc::clone(&self.inner),
        }
    }

    /// Cut or restore the link between two peers.
    ///
    /// Cutting fails every live connection between them; restoring only
    /// allows future negotiations to succeed.
    pub fn set_link(&self, a: &PeerId, b: &PeerId, up: bool) {
        let mut inner = self.inner.lock();
        let key = link_key(a, b);
        if up {
            inner.down.remove(&key);
            return;
        }
        inner.down.insert(key);

        let affected: Vec<u64> = inner
            .endpoints
            .iter()
            .filter(|(_, e)| e.linked.is_some() && link_key(&e.owner, &e.remote) == link_key(a, b))
            .map(|(id, _)| *id)
            .collect();
        for id in &affected {
            inner.unlink(*id, false);
        }
        for id in affected {
            if let Some(e) = inner.endpoints.get_mut(&id) {
                e.set_state(ConnectionState::Failed);
            }
        }
        tracing::debug!(a = %a, b = %b, "loopback link cut");
    }

    /// Number of live connections owned by `owner`.
    #[must_use]
    pub fn open_connections(&self, owner: &PeerId) -> usize {
        self.inner
            .lock()
            .endpoints
            .values()
            .filter(|e| &e.owner == owner)
            .count()
    }

    /// Total number of connections ever created on this network.
    #[must_use]
    pub fn connections_created(&self) -> usize {
        self.inner.lock().created
    }

    /// Whether a live connection from `a` is linked to one owned by `b`.
    #[must_use]
    pub fn is_linked(&self, a: &PeerId, b: &PeerId) -> bool {
        let inner = self.inner.lock();
        inner.endpoints.values().any(|e| {
            &e.owner == a
                && e.linked
                    .and_then(|id| inner.endpoints.get(&id))
                    .is_some_and(|other| &other.owner == b)
        })
    }
}

/// Backend for one simulated peer.
pub struct LoopbackBackend {
    owner: PeerId,
    net: Arc<Mutex<NetInner>>,
}

impl RtcBackend for LoopbackBackend {
    type Connection = LoopbackConnection;

    async fn create_connection(
        &self,
        peer: &PeerId,
        events: RtcEventSink,
    ) -> Result<LoopbackConnection, RtcError> {
        let mut inner = self.net.lock();
        inner.next_endpoint += 1;
        inner.created += 1;
        let id = inner.next_endpoint;
        inner.endpoints.insert(
            id,
            Endpoint {
                owner: self.owner.clone(),
                remote: peer.clone(),
                sink: events,
                state: ConnectionState::New,
                local_desc: None,
                remote_desc: None,
                linked: None,
                channels: Vec::new(),
            },
        );
        Ok(LoopbackConnection {
            id,
            owner: self.owner.clone(),
            net: Arc::clone(&self.net),
        })
    }
}

/// One simulated peer connection.
pub struct LoopbackConnection {
    id: u64,
    owner: PeerId,
    net: Arc<Mutex<NetInner>>,
}

impl LoopbackConnection {
    fn describe(&self, kind: SdpKind, ice_restart: bool) -> SessionDescription {
        let sdp = format!(
            "loopback ep={} owner={} restart={ice_restart}",
            self.id, self.owner
        );
        match kind {
            SdpKind::Offer => SessionDescription::offer(sdp),
            SdpKind::Answer => SessionDescription::answer(sdp),
        }
    }
}

impl RtcConnection for LoopbackConnection {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, RtcError> {
        let mut inner = self.net.lock();
        let endpoint = inner.endpoints.get_mut(&self.id).ok_or(RtcError::Closed)?;
        if ice_restart && endpoint.linked.is_none() {
            endpoint.set_state(ConnectionState::Connecting);
        }
        Ok(self.describe(SdpKind::Offer, ice_restart))
    }

    async fn create_answer(&self) -> Result<SessionDescription, RtcError> {
        let inner = self.net.lock();
        let endpoint = inner.endpoints.get(&self.id).ok_or(RtcError::Closed)?;
        if endpoint.remote_desc.is_none() {
            return Err(RtcError::Negotiation(
                "no remote offer to answer".to_string(),
            ));
        }
        Ok(self.describe(SdpKind::Answer, false))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), RtcError> {
        let mut inner = self.net.lock();
        let endpoint = inner.endpoints.get_mut(&self.id).ok_or(RtcError::Closed)?;
        endpoint.local_desc = Some(description);
        if endpoint.state == ConnectionState::New {
            endpoint.set_state(ConnectionState::Connecting);
        }
        endpoint
            .sink
            .emit(RtcEvent::IceCandidate(IceCandidate::new(format!(
                "candidate:loopback {} 1 udp 2130706431 127.0.0.1 9 typ host",
                self.id
            ))));
        inner.try_link(self.id);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), RtcError> {
        if endpoint_of(&description).is_none() {
            return Err(RtcError::Negotiation(format!(
                "unrecognized description: {}",
                description.sdp
            )));
        }
        let mut inner = self.net.lock();
        let endpoint = inner.endpoints.get_mut(&self.id).ok_or(RtcError::Closed)?;
        endpoint.remote_desc = Some(description);
        if endpoint.state == ConnectionState::New {
            endpoint.set_state(ConnectionState::Connecting);
        }
        inner.try_link(self.id);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError> {
        let inner = self.net.lock();
        if !inner.endpoints.contains_key(&self.id) {
            return Err(RtcError::Closed);
        }
        if !candidate.candidate.starts_with("candidate:") {
            return Err(RtcError::Negotiation(format!(
                "malformed candidate: {}",
                candidate.candidate
            )));
        }
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<ChannelId, RtcError> {
        let mut inner = self.net.lock();
        let id = inner.channel_id();
        let endpoint = inner.endpoints.get_mut(&self.id).ok_or(RtcError::Closed)?;
        endpoint.channels.push(Channel {
            id,
            label: label.to_string(),
            inbound: false,
            mirror: None,
            open: false,
        });
        if let Some(partner) = endpoint.linked {
            inner.mirror_channels(self.id, partner);
        }
        Ok(id)
    }

    async fn send(&self, channel: ChannelId, data: String) -> Result<(), RtcError> {
        let inner = self.net.lock();
        let endpoint = inner.endpoints.get(&self.id).ok_or(RtcError::Closed)?;
        let local = endpoint
            .channels
            .iter()
            .find(|c| c.id == channel)
            .ok_or(RtcError::UnknownChannel(channel))?;
        let (Some(mirror), Some(partner)) = (local.mirror, endpoint.linked) else {
            return Err(RtcError::ChannelNotOpen(channel));
        };
        if !local.open {
            return Err(RtcError::ChannelNotOpen(channel));
        }
        let remote = inner.endpoints.get(&partner).ok_or(RtcError::Closed)?;
        remote.sink.emit(RtcEvent::ChannelMessage {
            channel: mirror,
            data,
        });
        Ok(())
    }

    async fn close(&self) {
        let mut inner = self.net.lock();
        if inner.endpoints.contains_key(&self.id) {
            inner.unlink(self.id, true);
            inner.endpoints.remove(&self.id);
        }
    }
}
