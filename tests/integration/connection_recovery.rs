//! Integration tests for connection failure recovery.
//!
//! Links between loopback peers are cut and restored to drive the
//! two-step recovery cycle: an ICE restart first, a full recreate if that
//! fails too. A connection whose remote side goes away is disconnected and
//! walks the same cycle. Also covers the negotiation watchdog and the rule
//! that offline peers are not reconnected.

use std::sync::Arc;
use std::time::Duration;

use peerlink::config::ClientConfig;
use peerlink::crypto::keys::{KeyProvider, SharedKeyProvider};
use peerlink::delivery::SendOutcome;
use peerlink::notice::{NoticeKind, PeerNotice};
use peerlink::rtc::ConnectionState;
use peerlink::rtc::loopback::{LoopbackBackend, LoopbackNetwork};
use peerlink::service::PeerService;
use peerlink::signal::loopback::{LoopbackSignalHub, LoopbackSignaling};
use peerlink::store::memory::InMemoryStore;

use peerlink_proto::message::{Message, MessageBody, PeerId};
use peerlink_proto::signal::SignalMessage;

use tokio::sync::mpsc;
use tokio::time::timeout;

type Service = PeerService<LoopbackBackend, LoopbackSignaling, InMemoryStore>;

const WAIT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Node {
    id: PeerId,
    service: Arc<Service>,
    notices: mpsc::Receiver<PeerNotice>,
    inbound: mpsc::UnboundedReceiver<Vec<Message>>,
}

struct Mesh {
    hub: LoopbackSignalHub,
    net: LoopbackNetwork,
    store: InMemoryStore,
    keys: Arc<dyn KeyProvider>,
}

fn recovery_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.delivery.batch_interval = Duration::from_millis(20);
    config.peer.recreate_delay = Duration::from_millis(30);
    config.peer.negotiation_timeout = Duration::from_secs(1);
    config.peer.connection_check_interval = Duration::from_millis(100);
    config
}

impl Mesh {
    fn new() -> Self {
        Self {
            hub: LoopbackSignalHub::new(),
            net: LoopbackNetwork::new(),
            store: InMemoryStore::new(),
            keys: Arc::new(SharedKeyProvider::generate()),
        }
    }

    fn node_with(&self, name: &str, config: &ClientConfig) -> Node {
        let id = PeerId::new(name);
        let (signaling, signal_events) = self.hub.join(id.clone(), None, 256);
        let (service, notices) = PeerService::new(
            self.net.backend(id.clone()),
            Arc::new(signaling),
            signal_events,
            self.store.clone(),
            Arc::clone(&self.keys),
            config,
        );
        let inbound = service.subscribe();
        Node {
            id,
            service,
            notices,
            inbound,
        }
    }

    fn started(&self, name: &str) -> Node {
        let node = self.node_with(name, &recovery_config());
        node.service.start();
        node
    }
}

/// Wait for `kind` about `peer`, returning every notice seen on the way.
async fn notices_until(node: &mut Node, kind: NoticeKind, peer: &PeerId) -> Vec<NoticeKind> {
    let mut seen = Vec::new();
    timeout(WAIT, async {
        loop {
            let notice = node.notices.recv().await.expect("notice stream closed");
            let done = notice.kind == kind && notice.peer.as_ref() == Some(peer);
            seen.push(notice.kind);
            if done {
                return;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {kind:?}"));
    seen
}

async fn wait_chat(node: &mut Node, text: &str) {
    timeout(WAIT, async {
        loop {
            let batch = node.inbound.recv().await.expect("inbound stream closed");
            if batch
                .iter()
                .any(|m| matches!(&m.body, MessageBody::Chat { text: t } if t == text))
            {
                return;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {text:?}"));
}

async fn wait_connected(node: &Node, peer: &PeerId) {
    timeout(WAIT, async {
        loop {
            let manager = node.service.connections();
            if manager.state(peer).await == Some(ConnectionState::Connected)
                && manager.has_open_channel(peer).await
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection never recovered");
}

async fn connected_pair(mesh: &Mesh) -> (Node, Node) {
    let alice = mesh.started("alice");
    let mut bob = mesh.started("bob");
    let hello = Message::chat(alice.id.clone(), bob.id.clone(), "hello");
    alice.service.send_message(hello).await;
    wait_chat(&mut bob, "hello").await;
    wait_connected(&alice, &bob.id).await;
    (alice, bob)
}

fn restart_offers(mesh: &Mesh) -> usize {
    mesh.hub
        .routed()
        .iter()
        .filter(|m| matches!(m, SignalMessage::Offer { offer, .. } if offer.sdp.contains("restart=true")))
        .count()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failure_restarts_ice_then_recreates_and_recovers() {
    let mesh = Mesh::new();
    let (mut alice, mut bob) = connected_pair(&mesh).await;
    let created_before = mesh.net.connections_created();

    mesh.net.set_link(&alice.id, &bob.id, false);

    let seen = notices_until(&mut alice, NoticeKind::Recreating, &bob.id).await;
    let restart_at = seen
        .iter()
        .position(|k| *k == NoticeKind::IceRestart)
        .expect("no ICE restart before recreate");
    assert!(restart_at < seen.len() - 1);
    assert!(restart_offers(&mesh) >= 1);

    mesh.net.set_link(&alice.id, &bob.id, true);
    wait_connected(&alice, &bob.id).await;
    assert!(mesh.net.connections_created() > created_before);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let msg = Message::chat(alice.id.clone(), bob.id.clone(), "after recovery");
    assert!(alice.service.send_message(msg).await.is_accepted());
    wait_chat(&mut bob, "after recovery").await;
}

#[tokio::test]
async fn messages_sent_during_outage_are_delivered_after_recovery() {
    let mesh = Mesh::new();
    let (mut alice, mut bob) = connected_pair(&mesh).await;

    mesh.net.set_link(&alice.id, &bob.id, false);
    notices_until(&mut alice, NoticeKind::Recreating, &bob.id).await;

    let msg = Message::chat(alice.id.clone(), bob.id.clone(), "queued in outage");
    assert_eq!(alice.service.send_message(msg).await, SendOutcome::Queued);
    assert!(alice.service.pending_len(&bob.id) >= 1);

    mesh.net.set_link(&alice.id, &bob.id, true);
    wait_chat(&mut bob, "queued in outage").await;
    assert_eq!(alice.service.pending_len(&bob.id), 0);
}

#[tokio::test]
async fn offline_peer_is_not_recreated() {
    let mesh = Mesh::new();
    let (mut alice, bob) = connected_pair(&mesh).await;

    mesh.hub.disconnect(&bob.id);
    notices_until(&mut alice, NoticeKind::PeerOffline, &bob.id).await;

    mesh.net.set_link(&alice.id, &bob.id, false);
    notices_until(&mut alice, NoticeKind::Recreating, &bob.id).await;

    // Well past the recreate delay.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!alice.service.connections().has_connection(&bob.id).await);
    assert_eq!(mesh.net.open_connections(&alice.id), 0);
}

#[tokio::test]
async fn stalled_negotiation_is_treated_as_failure() {
    let mesh = Mesh::new();
    let mut config = recovery_config();
    config.peer.negotiation_timeout = Duration::from_millis(100);
    config.peer.connection_check_interval = Duration::from_millis(20);

    let mut alice = mesh.node_with("alice", &config);
    alice.service.start();
    let mut bob = mesh.node_with("bob", &recovery_config());

    let msg = Message::chat(alice.id.clone(), bob.id.clone(), "eventually");
    assert_eq!(alice.service.send_message(msg).await, SendOutcome::Queued);

    let seen = notices_until(&mut alice, NoticeKind::Recreating, &bob.id).await;
    assert!(seen.contains(&NoticeKind::IceRestart));
    assert_eq!(alice.service.pending_len(&bob.id), 1);

    bob.service.start();
    wait_chat(&mut bob, "eventually").await;
}

#[tokio::test]
async fn disconnected_peer_is_reconnected_when_it_returns() {
    let mesh = Mesh::new();
    let (mut alice, mut bob) = connected_pair(&mesh).await;

    // Alice drops her connections but stays online in signaling.
    alice.service.stop().await;

    let seen = notices_until(&mut bob, NoticeKind::IceRestart, &alice.id).await;
    assert!(seen.contains(&NoticeKind::StateChanged(ConnectionState::Disconnected)));

    let msg = Message::chat(bob.id.clone(), alice.id.clone(), "while you were away");
    assert_eq!(bob.service.send_message(msg).await, SendOutcome::Queued);
    assert_eq!(bob.service.pending_len(&alice.id), 1);

    alice.service.start();
    wait_chat(&mut alice, "while you were away").await;
    wait_connected(&bob, &alice.id).await;
    assert_eq!(bob.service.pending_len(&alice.id), 0);
    assert!(restart_offers(&mesh) >= 1);
}

#[tokio::test]
async fn unanswered_restart_after_disconnect_escalates_to_recreate() {
    let mesh = Mesh::new();
    let (alice, mut bob) = connected_pair(&mesh).await;

    alice.service.stop().await;

    let seen = notices_until(&mut bob, NoticeKind::Recreating, &alice.id).await;
    let disconnected_at = seen
        .iter()
        .position(|k| *k == NoticeKind::StateChanged(ConnectionState::Disconnected))
        .expect("no disconnect before recreate");
    let restart_at = seen
        .iter()
        .position(|k| *k == NoticeKind::IceRestart)
        .expect("no ICE restart before recreate");
    assert!(disconnected_at < restart_at);
    assert!(restart_at < seen.len() - 1);
}
