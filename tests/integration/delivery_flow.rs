//! Integration tests for direct message delivery between two peers.
//!
//! Two `PeerService`s talk over the loopback signaling hub and the loopback
//! RTC network and share one in-memory store. Covers:
//!
//! 1. First message is queued, negotiated, delivered and acknowledged once.
//! 2. Pending messages replay in order when the channel opens.
//! 3. Offline recipients get a sealed copy in the offline store.
//! 4. A failing store keeps the message pending until the peer returns.
//! 5. Duplicate, spoofed and undecryptable frames are handled.
//! 6. Bursts are dispatched in batches.

use std::sync::Arc;
use std::time::Duration;

use peerlink::config::ClientConfig;
use peerlink::crypto::CryptoGuard;
use peerlink::crypto::keys::{KeyProvider, SessionKey, SharedKeyProvider};
use peerlink::delivery::SendOutcome;
use peerlink::notice::{NoticeKind, PeerNotice};
use peerlink::rtc::loopback::{LoopbackBackend, LoopbackNetwork};
use peerlink::service::PeerService;
use peerlink::signal::loopback::{LoopbackSignalHub, LoopbackSignaling};
use peerlink::store::memory::InMemoryStore;

use peerlink_proto::codec;
use peerlink_proto::message::{Message, MessageBody, MessageId, MessageKind, PeerId, Recipient};

use tokio::sync::mpsc;
use tokio::time::timeout;

type Service = PeerService<LoopbackBackend, LoopbackSignaling, InMemoryStore>;

const WAIT: Duration = Duration::from_secs(5);

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

fn test_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.delivery.batch_interval = Duration::from_millis(20);
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

    /// Join the hub as `name` without starting the service.
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

    fn node(&self, name: &str) -> Node {
        self.node_with(name, &test_config())
    }

    fn started(&self, name: &str) -> Node {
        let node = self.node(name);
        node.service.start();
        node
    }
}

/// Wait for the first inbound message matching `pred`.
async fn recv_matching(node: &mut Node, pred: impl Fn(&Message) -> bool) -> Message {
    timeout(WAIT, async {
        loop {
            let batch = node.inbound.recv().await.expect("inbound stream closed");
            if let Some(message) = batch.into_iter().find(|m| pred(m)) {
                return message;
            }
        }
    })
    .await
    .expect("timed out waiting for message")
}

/// Collect inbound messages matching `pred` for `window`.
async fn collect_for(
    node: &mut Node,
    window: Duration,
    pred: impl Fn(&Message) -> bool,
) -> Vec<Message> {
    let mut found = Vec::new();
    let _ = timeout(window, async {
        while let Some(batch) = node.inbound.recv().await {
            found.extend(batch.into_iter().filter(|m| pred(m)));
        }
    })
    .await;
    found
}

/// Collect the texts of `count` chat messages, in arrival order.
async fn chat_texts(node: &mut Node, count: usize) -> Vec<String> {
    let mut texts = Vec::new();
    timeout(WAIT, async {
        while texts.len() < count {
            let batch = node.inbound.recv().await.expect("inbound stream closed");
            texts.extend(batch.into_iter().filter_map(|m| match m.body {
                MessageBody::Chat { text } => Some(text),
                _ => None,
            }));
        }
    })
    .await
    .expect("timed out waiting for chat messages");
    texts
}

async fn wait_notice(node: &mut Node, kind: NoticeKind, peer: &PeerId) -> PeerNotice {
    timeout(WAIT, async {
        loop {
            let notice = node.notices.recv().await.expect("notice stream closed");
            if notice.kind == kind && notice.peer.as_ref() == Some(peer) {
                return notice;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {kind:?}"))
}

async fn wait_open(node: &Node, peer: &PeerId) {
    timeout(WAIT, async {
        while !node.service.connections().has_open_channel(peer).await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("channel never opened");
}

fn is_receipt_for(id: &MessageId) -> impl Fn(&Message) -> bool + '_ {
    move |m: &Message| matches!(&m.body, MessageBody::DeliveryReceipt { message_id } if message_id == id)
}

fn is_chat(m: &Message) -> bool {
    m.kind() == MessageKind::Chat
}

/// Seal `message` for `to` and write it straight onto `from`'s channel.
async fn send_raw(mesh: &Mesh, from: &Node, to: &PeerId, message: &Message) {
    let envelope = CryptoGuard::new(Arc::clone(&mesh.keys))
        .seal(to, message)
        .expect("seal should succeed");
    let frame = codec::encode_envelope(&envelope).expect("encode should succeed");
    from.service
        .connections()
        .send_on_channel(to, frame)
        .await
        .expect("raw send should succeed");
}

/// Alice and Bob with an open channel between them.
async fn connected_pair(mesh: &Mesh) -> (Node, Node) {
    let mut alice = mesh.started("alice");
    let mut bob = mesh.started("bob");

    let hello = Message::chat(alice.id.clone(), bob.id.clone(), "hello");
    let id = hello.id.clone();
    alice.service.send_message(hello).await;
    recv_matching(&mut bob, is_chat).await;
    recv_matching(&mut alice, is_receipt_for(&id)).await;
    wait_open(&alice, &bob.id).await;
    (alice, bob)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn first_message_is_queued_then_delivered_and_acknowledged_once() {
    let mesh = Mesh::new();
    let mut alice = mesh.started("alice");
    let mut bob = mesh.started("bob");

    let msg = Message::chat(alice.id.clone(), bob.id.clone(), "hi");
    let id = msg.id.clone();
    assert_eq!(alice.service.send_message(msg).await, SendOutcome::Queued);

    let received = recv_matching(&mut bob, is_chat).await;
    assert_eq!(received.id, id);
    assert_eq!(received.sender_id, alice.id);
    assert_eq!(received.body, MessageBody::Chat { text: "hi".into() });

    let receipt = recv_matching(&mut alice, is_receipt_for(&id)).await;
    assert_eq!(receipt.sender_id, bob.id);

    let extra = collect_for(&mut alice, Duration::from_millis(200), is_receipt_for(&id)).await;
    assert!(extra.is_empty(), "receipt delivered more than once");
    assert_eq!(alice.service.pending_len(&bob.id), 0);
}

#[tokio::test]
async fn open_channel_sends_directly_in_both_directions() {
    let mesh = Mesh::new();
    let (mut alice, mut bob) = connected_pair(&mesh).await;

    let msg = Message::chat(alice.id.clone(), bob.id.clone(), "direct");
    assert_eq!(alice.service.send_message(msg).await, SendOutcome::Sent);
    assert_eq!(chat_texts(&mut bob, 1).await, ["direct"]);

    wait_open(&bob, &alice.id).await;
    let reply = Message::chat(bob.id.clone(), alice.id.clone(), "reply");
    assert_eq!(bob.service.send_message(reply).await, SendOutcome::Sent);
    assert_eq!(chat_texts(&mut alice, 1).await, ["reply"]);
}

#[tokio::test]
async fn pending_messages_replay_in_order_when_channel_opens() {
    let mesh = Mesh::new();
    let alice = mesh.started("alice");
    let mut bob = mesh.node("bob");

    for n in 0..5 {
        let msg = Message::chat(alice.id.clone(), bob.id.clone(), format!("m{n}"));
        assert_eq!(alice.service.send_message(msg).await, SendOutcome::Queued);
    }
    assert_eq!(alice.service.pending_len(&bob.id), 5);

    bob.service.start();

    assert_eq!(chat_texts(&mut bob, 5).await, ["m0", "m1", "m2", "m3", "m4"]);
    assert_eq!(alice.service.pending_len(&bob.id), 0);
}

#[tokio::test]
async fn offline_recipient_goes_to_offline_store() {
    let mesh = Mesh::new();
    let mut alice = mesh.started("alice");
    let bob = mesh.started("bob");

    mesh.hub.disconnect(&bob.id);
    wait_notice(&mut alice, NoticeKind::PeerOffline, &bob.id).await;

    let msg = Message::chat(alice.id.clone(), bob.id.clone(), "while you were out");
    let id = msg.id.clone();
    assert_eq!(alice.service.send_message(msg).await, SendOutcome::Queued);

    let entries = mesh.store.offline_entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].recipient_id, "bob");
    assert_eq!(entries[0].message.message.message_id, id);
    assert_eq!(entries[0].message.message.kind, MessageKind::Chat);
    assert!(!entries[0].message.delivered);

    let sealed = &entries[0].message.message.envelope;
    assert_eq!(sealed.iv.len(), 12);
    let ciphertext = String::from_utf8_lossy(&sealed.data);
    assert!(!ciphertext.contains("while you were out"));

    assert_eq!(mesh.net.connections_created(), 0);
    assert_eq!(alice.service.pending_len(&bob.id), 0);
}

#[tokio::test]
async fn store_failure_keeps_message_pending_until_peer_returns() {
    let mesh = Mesh::new();
    let mut alice = mesh.started("alice");
    let mut bob = mesh.started("bob");

    mesh.hub.disconnect(&bob.id);
    wait_notice(&mut alice, NoticeKind::PeerOffline, &bob.id).await;

    mesh.store.set_available(false);
    let msg = Message::chat(alice.id.clone(), bob.id.clone(), "kept");
    assert_eq!(alice.service.send_message(msg).await, SendOutcome::Queued);

    let notice = wait_notice(&mut alice, NoticeKind::StoreFallback, &bob.id).await;
    assert!(notice.detail.is_some());
    assert_eq!(alice.service.pending_len(&bob.id), 1);
    assert!(mesh.store.offline_entries().is_empty());

    mesh.store.set_available(true);
    mesh.hub.reconnect(&bob.id);

    assert_eq!(chat_texts(&mut bob, 1).await, ["kept"]);
    assert_eq!(alice.service.pending_len(&bob.id), 0);
}

#[tokio::test]
async fn duplicate_frames_are_dispatched_once_and_acknowledged_each_time() {
    let mesh = Mesh::new();
    let (mut alice, mut bob) = connected_pair(&mesh).await;

    let msg = Message::chat(alice.id.clone(), bob.id.clone(), "twice");
    let id = msg.id.clone();
    send_raw(&mesh, &alice, &bob.id, &msg).await;
    send_raw(&mesh, &alice, &bob.id, &msg).await;

    let dispatched = collect_for(&mut bob, Duration::from_millis(300), is_chat).await;
    assert_eq!(dispatched.len(), 1);
    assert_eq!(dispatched[0].id, id);

    let receipts = collect_for(&mut alice, Duration::from_millis(300), is_receipt_for(&id)).await;
    assert_eq!(receipts.len(), 2);
}

#[tokio::test]
async fn spoofed_sender_is_dropped() {
    let mesh = Mesh::new();
    let (alice, mut bob) = connected_pair(&mesh).await;

    let forged = Message::chat(PeerId::new("mallory"), bob.id.clone(), "trust me");
    send_raw(&mesh, &alice, &bob.id, &forged).await;

    let notice = wait_notice(&mut bob, NoticeKind::PayloadDropped, &alice.id).await;
    assert!(notice.detail.unwrap_or_default().contains("mallory"));
    assert!(collect_for(&mut bob, Duration::from_millis(200), is_chat).await.is_empty());
}

#[tokio::test]
async fn frame_sealed_with_another_key_fails_decryption() {
    let mesh = Mesh::new();
    let (alice, mut bob) = connected_pair(&mesh).await;

    let stranger = CryptoGuard::new(Arc::new(SharedKeyProvider::new(SessionKey::generate())));
    let msg = Message::chat(alice.id.clone(), bob.id.clone(), "garbled");
    let envelope = stranger.seal(&bob.id, &msg).expect("seal should succeed");
    let frame = codec::encode_envelope(&envelope).expect("encode should succeed");
    alice
        .service
        .connections()
        .send_on_channel(&bob.id, frame)
        .await
        .expect("raw send should succeed");

    wait_notice(&mut bob, NoticeKind::DecryptFailed, &alice.id).await;
    assert!(collect_for(&mut bob, Duration::from_millis(200), is_chat).await.is_empty());
}

#[tokio::test]
async fn malformed_and_oversized_frames_are_dropped() {
    let mesh = Mesh::new();
    let (alice, mut bob) = connected_pair(&mesh).await;
    let max = ClientConfig::default().delivery.max_payload_size;

    alice
        .service
        .connections()
        .send_on_channel(&bob.id, "not json".to_string())
        .await
        .expect("raw send should succeed");
    let notice = wait_notice(&mut bob, NoticeKind::PayloadDropped, &alice.id).await;
    assert!(notice.detail.is_some());

    alice
        .service
        .connections()
        .send_on_channel(&bob.id, "x".repeat(max + 1))
        .await
        .expect("raw send should succeed");
    let notice = wait_notice(&mut bob, NoticeKind::PayloadDropped, &alice.id).await;
    assert!(notice.detail.unwrap_or_default().contains("bytes"));
}

#[tokio::test]
async fn read_receipt_needs_an_open_channel() {
    let mesh = Mesh::new();
    let (alice, mut bob) = connected_pair(&mesh).await;

    let nobody = PeerId::new("carol");
    assert_eq!(
        alice.service.send_read_receipt(MessageId::new(), &nobody).await,
        SendOutcome::Failed
    );
    assert_eq!(alice.service.pending_len(&nobody), 0);

    let id = MessageId::new();
    assert_eq!(
        alice.service.send_read_receipt(id.clone(), &bob.id).await,
        SendOutcome::Sent
    );
    let receipt = recv_matching(&mut bob, |m| m.kind() == MessageKind::ReadReceipt).await;
    assert_eq!(receipt.body, MessageBody::ReadReceipt { message_id: id });
}

#[tokio::test]
async fn invalid_messages_fail_without_side_effects() {
    let mesh = Mesh::new();
    let alice = mesh.started("alice");
    let bob = PeerId::new("bob");

    let empty = Message::chat(alice.id.clone(), bob.clone(), "");
    assert_eq!(alice.service.send_message(empty).await, SendOutcome::Failed);

    let local_only = Message::new(
        alice.id.clone(),
        Recipient::Peer(bob.clone()),
        MessageBody::PeerConnected { peer_id: bob.clone() },
    );
    assert_eq!(alice.service.send_message(local_only).await, SendOutcome::Failed);

    assert_eq!(alice.service.pending_len(&bob), 0);
    assert_eq!(mesh.net.connections_created(), 0);
}

#[tokio::test]
async fn burst_is_dispatched_in_at_most_two_batches() {
    let mesh = Mesh::new();
    let alice = mesh.started("alice");
    let mut config = test_config();
    config.delivery.batch_interval = Duration::from_millis(500);
    let mut bob = mesh.node_with("bob", &config);

    for n in 0..60 {
        let msg = Message::chat(alice.id.clone(), bob.id.clone(), format!("burst {n}"));
        assert_eq!(alice.service.send_message(msg).await, SendOutcome::Queued);
    }
    bob.service.start();

    let mut chat_batches = 0;
    let mut chats = 0;
    timeout(WAIT, async {
        while chats < 60 {
            let batch = bob.inbound.recv().await.expect("inbound stream closed");
            let in_batch = batch.iter().filter(|m| is_chat(m)).count();
            if in_batch > 0 {
                chat_batches += 1;
                chats += in_batch;
            }
        }
    })
    .await
    .expect("timed out waiting for burst");

    assert_eq!(chats, 60);
    assert!(chat_batches <= 2, "burst split into {chat_batches} batches");
}

#[tokio::test]
async fn stop_closes_connections_and_restart_reconnects() {
    let mesh = Mesh::new();
    let (alice, mut bob) = connected_pair(&mesh).await;

    alice.service.stop().await;
    assert!(!alice.service.is_running());
    assert!(!alice.service.connections().has_connection(&bob.id).await);
    assert_eq!(mesh.net.open_connections(&alice.id), 0);

    alice.service.start();
    let msg = Message::chat(alice.id.clone(), bob.id.clone(), "back again");
    assert_eq!(alice.service.send_message(msg).await, SendOutcome::Queued);
    assert_eq!(chat_texts(&mut bob, 1).await, ["back again"]);
}
