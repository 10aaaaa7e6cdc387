//! [`RtcBackend`] on top of the `webrtc` crate.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use peerlink_proto::message::PeerId;
use peerlink_proto::signal::{IceCandidate, SdpKind, SessionDescription};

use super::{
    ChannelId, ConnectionState, RtcBackend, RtcConnection, RtcError, RtcEvent, RtcEventSink,
};

type ChannelMap = Arc<Mutex<HashMap<ChannelId, Arc<RTCDataChannel>>>>;

/// Creates real peer connections.
pub struct WebRtcBackend {
    api: API,
    ice_servers: Vec<String>,
    next_channel: Arc<AtomicU64>,
}

impl WebRtcBackend {
    /// Creates a backend using the given STUN/TURN server URLs.
    #[must_use]
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self {
            api: APIBuilder::new().build(),
            ice_servers,
            next_channel: Arc::new(AtomicU64::new(1)),
        }
    }
}

impl RtcBackend for WebRtcBackend {
    type Connection = WebRtcConnection;

    async fn create_connection(
        &self,
        peer: &PeerId,
        events: RtcEventSink,
    ) -> Result<WebRtcConnection, RtcError> {
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(|e| RtcError::Backend(e.to_string()))?,
        );
        let channels: ChannelMap = Arc::new(Mutex::new(HashMap::new()));

        let sink = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => sink.emit(RtcEvent::IceCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    })),
                    Err(e) => tracing::warn!(error = %e, "failed to serialize local candidate"),
                }
            })
        }));

        let sink = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let sink = sink.clone();
            Box::pin(async move {
                if let Some(state) = map_state(state) {
                    sink.emit(RtcEvent::StateChanged(state));
                }
            })
        }));

        let sink = events.clone();
        let inbound = Arc::clone(&channels);
        let counter = Arc::clone(&self.next_channel);
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let sink = sink.clone();
            let inbound = Arc::clone(&inbound);
            let id = ChannelId(counter.fetch_add(1, Ordering::Relaxed));
            Box::pin(async move {
                tracing::debug!(peer = %sink.peer(), label = dc.label(), "remote data channel");
                wire_channel(&dc, id, &sink);
                inbound.lock().insert(id, Arc::clone(&dc));
                sink.emit(RtcEvent::ChannelCreated {
                    channel: id,
                    label: dc.label().to_string(),
                });
            })
        }));

        tracing::debug!(peer = %peer, "webrtc peer connection created");
        Ok(WebRtcConnection {
            pc,
            sink: events,
            channels,
            next_channel: Arc::clone(&self.next_channel),
        })
    }
}

/// A live `RTCPeerConnection`.
pub struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
    sink: RtcEventSink,
    channels: ChannelMap,
    next_channel: Arc<AtomicU64>,
}

impl RtcConnection for WebRtcConnection {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, RtcError> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = self.pc.create_offer(options).await.map_err(negotiation)?;
        from_rtc(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, RtcError> {
        let answer = self.pc.create_answer(None).await.map_err(negotiation)?;
        from_rtc(&answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), RtcError> {
        self.pc
            .set_local_description(to_rtc(description)?)
            .await
            .map_err(negotiation)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), RtcError> {
        self.pc
            .set_remote_description(to_rtc(description)?)
            .await
            .map_err(negotiation)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(negotiation)
    }

    async fn create_data_channel(&self, label: &str) -> Result<ChannelId, RtcError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(|e| RtcError::Backend(e.to_string()))?;
        let id = ChannelId(self.next_channel.fetch_add(1, Ordering::Relaxed));
        wire_channel(&dc, id, &self.sink);
        self.channels.lock().insert(id, dc);
        Ok(id)
    }

    async fn send(&self, channel: ChannelId, data: String) -> Result<(), RtcError> {
        let dc = self
            .channels
            .lock()
            .get(&channel)
            .cloned()
            .ok_or(RtcError::UnknownChannel(channel))?;
        if dc.ready_state() != RTCDataChannelState::Open {
            return Err(RtcError::ChannelNotOpen(channel));
        }
        dc.send_text(data)
            .await
            .map(|_| ())
            .map_err(|e| RtcError::Backend(e.to_string()))
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::debug!(peer = %self.sink.peer(), error = %e, "error closing peer connection");
        }
        self.channels.lock().clear();
    }
}

/// Forward channel lifecycle and text frames into the event sink.
fn wire_channel(dc: &Arc<RTCDataChannel>, id: ChannelId, sink: &RtcEventSink) {
    let on_open = sink.clone();
    dc.on_open(Box::new(move || {
        let sink = on_open.clone();
        Box::pin(async move { sink.emit(RtcEvent::ChannelOpen(id)) })
    }));

    let on_close = sink.clone();
    dc.on_close(Box::new(move || {
        let sink = on_close.clone();
        Box::pin(async move { sink.emit(RtcEvent::ChannelClosed(id)) })
    }));

    let on_error = sink.clone();
    dc.on_error(Box::new(move |err| {
        let sink = on_error.clone();
        Box::pin(async move {
            sink.emit(RtcEvent::ChannelError {
                channel: id,
                error: err.to_string(),
            });
        })
    }));

    let on_message = sink.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let sink = on_message.clone();
        Box::pin(async move {
            if !msg.is_string {
                tracing::debug!(channel = %id, "ignoring binary data channel frame");
                return;
            }
            match String::from_utf8(msg.data.to_vec()) {
                Ok(data) => sink.emit(RtcEvent::ChannelMessage { channel: id, data }),
                Err(e) => tracing::warn!(channel = %id, error = %e, "non-UTF-8 text frame"),
            }
        })
    }));
}

const fn map_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn negotiation(err: webrtc::Error) -> RtcError {
    RtcError::Negotiation(err.to_string())
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, RtcError> {
    match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    }
    .map_err(negotiation)
}

fn from_rtc(description: &RTCSessionDescription) -> Result<SessionDescription, RtcError> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp.clone())),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp.clone())),
        other => Err(RtcError::Negotiation(format!(
            "unsupported description type {other}"
        ))),
    }
}
