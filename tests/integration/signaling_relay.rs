//! Integration tests for the WebSocket signaling client against a real
//! relay.
//!
//! Each test starts a relay on `127.0.0.1:0` and connects clients to it.
//! The end-to-end test pairs the relay with loopback RTC so that a chat
//! message travels through real signaling and a simulated data channel.

use std::sync::Arc;
use std::time::Duration;

use peerlink::config::{ClientConfig, SignalingConfig};
use peerlink::crypto::keys::{KeyProvider, SharedKeyProvider};
use peerlink::notice::{NoticeKind, PeerNotice};
use peerlink::rtc::loopback::LoopbackNetwork;
use peerlink::service::PeerService;
use peerlink::signal::backoff::ReconnectPolicy;
use peerlink::signal::client::SignalingClient;
use peerlink::signal::{SignalSender, SignalingError, SignalingEvent};
use peerlink::store::memory::InMemoryStore;

use peerlink_proto::message::{Message, MessageBody, PeerId, UserId};
use peerlink_proto::presence::PresenceStatus;
use peerlink_proto::signal::{SessionDescription, SignalMessage};

use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn start_relay() -> String {
    let (addr, _handle) = peerlink_relay::relay::start_server("127.0.0.1:0")
        .await
        .expect("failed to start relay");
    format!("ws://{addr}/ws")
}

fn signaling_config(url: &str, user: Option<&str>) -> SignalingConfig {
    SignalingConfig {
        url: url.to_string(),
        user_id: user.map(UserId::new),
        connect_timeout: Duration::from_secs(2),
        reconnect: ReconnectPolicy {
            initial: Duration::from_millis(10),
            multiplier: 2.0,
            max_delay: Duration::from_millis(50),
            max_attempts: 2,
        },
    }
}

fn spawn_client(
    url: &str,
    name: &str,
    user: Option<&str>,
) -> (SignalingClient, mpsc::Receiver<SignalingEvent>) {
    SignalingClient::spawn(signaling_config(url, user), PeerId::new(name), 64)
        .expect("spawn signaling client")
}

async fn next_matching(
    events: &mut mpsc::Receiver<SignalingEvent>,
    pred: impl Fn(&SignalingEvent) -> bool,
) -> SignalingEvent {
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for signaling event")
}

async fn wait_connected(events: &mut mpsc::Receiver<SignalingEvent>) {
    next_matching(events, |e| *e == SignalingEvent::Connected).await;
}

fn presence_of(peer: &PeerId, status: PresenceStatus) -> impl Fn(&SignalingEvent) -> bool + '_ {
    move |e| {
        matches!(
            e,
            SignalingEvent::PresenceChanged { peer: Some(p), status: s, .. }
                if p == peer && *s == status
        )
    }
}

async fn wait_notice(notices: &mut mpsc::Receiver<PeerNotice>, kind: NoticeKind) -> PeerNotice {
    timeout(WAIT, async {
        loop {
            let notice = notices.recv().await.expect("notice stream closed");
            if notice.kind == kind {
                return notice;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {kind:?}"))
}

/// A port with nothing listening on it.
async fn dead_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind probe");
    let addr = listener.local_addr().expect("probe addr");
    drop(listener);
    format!("ws://{addr}/ws")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn clients_see_each_other_come_and_go() {
    let url = start_relay().await;
    let (alice, mut alice_events) = spawn_client(&url, "alice", Some("user-a"));
    wait_connected(&mut alice_events).await;
    assert!(alice.is_connected());

    let (bob, mut bob_events) = spawn_client(&url, "bob", None);
    wait_connected(&mut bob_events).await;

    let bob_id = PeerId::new("bob");
    next_matching(&mut alice_events, presence_of(&bob_id, PresenceStatus::Online)).await;

    let alice_id = PeerId::new("alice");
    let seen = next_matching(
        &mut bob_events,
        presence_of(&alice_id, PresenceStatus::Online),
    )
    .await;
    assert!(matches!(
        seen,
        SignalingEvent::PresenceChanged { user: Some(ref u), .. } if u.as_str() == "user-a"
    ));

    bob.shutdown();
    assert!(!bob.is_connected());
    next_matching(&mut alice_events, presence_of(&bob_id, PresenceStatus::Offline)).await;
}

#[tokio::test]
async fn offers_are_routed_with_the_real_sender() {
    let url = start_relay().await;
    let (alice, mut alice_events) = spawn_client(&url, "alice", None);
    let (_bob, mut bob_events) = spawn_client(&url, "bob", None);
    wait_connected(&mut alice_events).await;
    wait_connected(&mut bob_events).await;
    next_matching(
        &mut alice_events,
        presence_of(&PeerId::new("bob"), PresenceStatus::Online),
    )
    .await;

    alice
        .send(SignalMessage::Offer {
            offer: SessionDescription::offer("v=0 test"),
            recipient_id: PeerId::new("bob"),
            sender_id: PeerId::new("mallory"),
        })
        .await
        .expect("send offer");

    let event = next_matching(&mut bob_events, |e| matches!(e, SignalingEvent::Offer { .. })).await;
    let SignalingEvent::Offer { from, offer } = event else {
        unreachable!();
    };
    assert_eq!(from, PeerId::new("alice"));
    assert_eq!(offer.sdp, "v=0 test");
}

#[tokio::test]
async fn chat_message_flows_over_relay_signaling() {
    let url = start_relay().await;
    let net = LoopbackNetwork::new();
    let store = InMemoryStore::new();
    let keys: Arc<dyn KeyProvider> = Arc::new(SharedKeyProvider::generate());

    let mut config = ClientConfig::default();
    config.delivery.batch_interval = Duration::from_millis(20);
    config.signaling = signaling_config(&url, None);

    let alice_id = PeerId::new("alice");
    let (alice_signaling, alice_events) = SignalingClient::spawn(
        config.signaling.clone(),
        alice_id.clone(),
        64,
    )
    .expect("spawn alice");
    let (alice, mut alice_notices) = PeerService::new(
        net.backend(alice_id.clone()),
        Arc::new(alice_signaling),
        alice_events,
        store.clone(),
        Arc::clone(&keys),
        &config,
    );
    alice.start();

    let bob_id = PeerId::new("bob");
    let (bob_signaling, bob_events) =
        SignalingClient::spawn(config.signaling.clone(), bob_id.clone(), 64).expect("spawn bob");
    let (bob, _bob_notices) = PeerService::new(
        net.backend(bob_id.clone()),
        Arc::new(bob_signaling),
        bob_events,
        store.clone(),
        keys,
        &config,
    );
    let mut bob_inbound = bob.subscribe();
    bob.start();

    let online = wait_notice(&mut alice_notices, NoticeKind::PeerOnline).await;
    assert_eq!(online.peer.as_ref(), Some(&bob_id));

    let msg = Message::chat(alice_id.clone(), bob_id.clone(), "via relay");
    assert!(alice.send_message(msg).await.is_accepted());

    let received = timeout(WAIT, async {
        loop {
            let batch = bob_inbound.recv().await.expect("inbound closed");
            if let Some(m) = batch
                .into_iter()
                .find(|m| matches!(&m.body, MessageBody::Chat { text } if text == "via relay"))
            {
                return m;
            }
        }
    })
    .await
    .expect("message never arrived");
    assert_eq!(received.sender_id, alice_id);
    assert!(net.is_linked(&alice_id, &bob_id));

    alice.stop().await;
    bob.stop().await;
}

#[tokio::test]
async fn unreachable_relay_backs_off_then_gives_up() {
    let url = dead_url().await;
    let (client, mut events) = spawn_client(&url, "alice", None);

    let mut reconnects = Vec::new();
    let attempts = timeout(WAIT, async {
        loop {
            match events.recv().await.expect("event stream closed") {
                SignalingEvent::Reconnecting { attempt, delay } => {
                    reconnects.push((attempt, delay.as_millis()));
                }
                SignalingEvent::Unavailable { attempts } => return attempts,
                SignalingEvent::Connected => panic!("connected to a dead port"),
                _ => {}
            }
        }
    })
    .await
    .expect("client never gave up");

    assert_eq!(attempts, 2);
    assert_eq!(reconnects, vec![(1, 10), (2, 20)]);
    assert!(!client.is_connected());
    assert!(matches!(
        client
            .send(SignalMessage::UserConnected {
                peer_id: PeerId::new("alice"),
                user_id: None,
            })
            .await,
        Err(SignalingError::NotConnected)
    ));
}

#[tokio::test]
async fn service_reports_signaling_unavailable() {
    let url = dead_url().await;
    let mut config = ClientConfig::default();
    config.signaling = signaling_config(&url, None);

    let id = PeerId::new("alice");
    let (signaling, events) =
        SignalingClient::spawn(config.signaling.clone(), id.clone(), 64).expect("spawn");
    let (service, mut notices) = PeerService::new(
        LoopbackNetwork::new().backend(id),
        Arc::new(signaling),
        events,
        InMemoryStore::new(),
        Arc::new(SharedKeyProvider::generate()),
        &config,
    );
    service.start();

    wait_notice(&mut notices, NoticeKind::SignalingReconnecting).await;
    let gave_up = wait_notice(&mut notices, NoticeKind::SignalingUnavailable).await;
    assert!(gave_up.peer.is_none());
    assert!(gave_up.detail.is_some_and(|d| d.contains('2')));
    service.stop().await;
}

#[tokio::test]
async fn non_websocket_url_is_rejected() {
    let result = SignalingClient::spawn(
        signaling_config("http://127.0.0.1:9000", None),
        PeerId::new("alice"),
        8,
    );
    assert!(matches!(result, Err(SignalingError::Unreachable(_))));
}
