//! Integration tests for the offline store path and presence heartbeat.
//!
//! Messages for a peer that is known to be offline are sealed and written
//! to the external store; the peer drains them with
//! `sync_offline_messages` when it comes back.

use std::sync::Arc;
use std::time::Duration;

use peerlink::config::ClientConfig;
use peerlink::crypto::CryptoGuard;
use peerlink::crypto::keys::{KeyProvider, SharedKeyProvider};
use peerlink::delivery::SendOutcome;
use peerlink::notice::{NoticeKind, PeerNotice};
use peerlink::rtc::loopback::{LoopbackBackend, LoopbackNetwork};
use peerlink::service::PeerService;
use peerlink::signal::loopback::{LoopbackSignalHub, LoopbackSignaling};
use peerlink::store::memory::InMemoryStore;
use peerlink::store::{ExternalStore, NewMessage, OfflineStatus, StoreError};

use peerlink_proto::message::{Message, MessageBody, PeerId, Recipient, UserId};
use peerlink_proto::presence::PresenceStatus;

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

    fn started_with(&self, name: &str, config: &ClientConfig) -> Node {
        let id = PeerId::new(name);
        let user = config.signaling.user_id.clone();
        let (signaling, signal_events) = self.hub.join(id.clone(), user, 256);
        let (service, notices) = PeerService::new(
            self.net.backend(id.clone()),
            Arc::new(signaling),
            signal_events,
            self.store.clone(),
            Arc::clone(&self.keys),
            config,
        );
        let inbound = service.subscribe();
        service.start();
        Node {
            id,
            service,
            notices,
            inbound,
        }
    }

    fn started(&self, name: &str) -> Node {
        self.started_with(name, &test_config())
    }
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

/// Collect chat texts until `count` have arrived.
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
    .expect("timed out collecting chat messages");
    texts
}

/// Bob, known to Alice as offline.
async fn offline_pair(mesh: &Mesh) -> (Node, Node) {
    let mut alice = mesh.started("alice");
    let bob = mesh.started("bob");
    mesh.hub.disconnect(&bob.id);
    wait_notice(&mut alice, NoticeKind::PeerOffline, &bob.id).await;
    (alice, bob)
}

/// Write `message` sealed by `guard` straight into `to`'s offline queue.
async fn plant(store: &InMemoryStore, guard: &CryptoGuard, to: &PeerId, message: &Message) {
    let envelope = guard.seal(to, message).expect("seal should succeed");
    let record = store
        .save_message(NewMessage {
            message_id: message.id.clone(),
            sender_id: PeerId::new("alice"),
            recipient: Recipient::Peer(to.clone()),
            envelope,
            kind: message.kind(),
            parent_message_id: None,
            timestamp: message.timestamp,
        })
        .await
        .expect("save message");
    store
        .add_to_offline_queue(&record, to.as_str())
        .await
        .expect("queue message");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn offline_messages_are_delivered_on_sync() {
    let mesh = Mesh::new();
    let (alice, mut bob) = offline_pair(&mesh).await;

    for text in ["one", "two", "three"] {
        let msg = Message::chat(alice.id.clone(), bob.id.clone(), text);
        assert_eq!(alice.service.send_message(msg).await, SendOutcome::Queued);
    }
    assert_eq!(alice.service.pending_len(&bob.id), 0);

    let entries = mesh.store.offline_entries();
    assert_eq!(entries.len(), 3);
    assert!(entries.iter().all(|e| e.recipient_id == "bob"));
    assert!(entries.iter().all(|e| e.status == OfflineStatus::Queued));
    // Sealed: the plaintext never reaches the store.
    assert!(
        entries
            .iter()
            .all(|e| !String::from_utf8_lossy(&e.message.message.envelope.data).contains("two"))
    );

    mesh.hub.reconnect(&bob.id);
    let synced = bob.service.sync_offline_messages().await.expect("sync");
    assert_eq!(synced, 3);
    assert_eq!(chat_texts(&mut bob, 3).await, vec!["one", "two", "three"]);

    assert!(mesh.store.offline_entries().is_empty());
    assert!(mesh.store.messages().iter().all(|m| m.delivered));
    assert_eq!(bob.service.sync_offline_messages().await.expect("resync"), 0);
}

#[tokio::test]
async fn sync_only_reads_own_queue() {
    let mesh = Mesh::new();
    let (alice, bob) = offline_pair(&mesh).await;

    let msg = Message::chat(alice.id.clone(), bob.id.clone(), "for bob");
    alice.service.send_message(msg).await;

    assert_eq!(alice.service.sync_offline_messages().await.expect("sync"), 0);
    assert_eq!(mesh.store.offline_entries().len(), 1);
}

#[tokio::test]
async fn undecryptable_entry_is_discarded() {
    let mesh = Mesh::new();
    let mut bob = mesh.started("bob");
    let alice = PeerId::new("alice");

    let stranger = CryptoGuard::new(Arc::new(SharedKeyProvider::generate()));
    let msg = Message::chat(alice.clone(), bob.id.clone(), "unreadable");
    plant(&mesh.store, &stranger, &bob.id, &msg).await;

    let synced = bob.service.sync_offline_messages().await.expect("sync");
    assert_eq!(synced, 0);
    let notice = wait_notice(&mut bob, NoticeKind::DecryptFailed, &alice).await;
    assert!(notice.detail.is_some());
    assert!(mesh.store.offline_entries().is_empty());
}

#[tokio::test]
async fn entry_with_forged_sender_is_discarded() {
    let mesh = Mesh::new();
    let mut bob = mesh.started("bob");
    let alice = PeerId::new("alice");

    let guard = CryptoGuard::new(Arc::clone(&mesh.keys));
    let forged = Message::chat(PeerId::new("mallory"), bob.id.clone(), "trust me");
    plant(&mesh.store, &guard, &bob.id, &forged).await;

    let synced = bob.service.sync_offline_messages().await.expect("sync");
    assert_eq!(synced, 0);
    let notice = wait_notice(&mut bob, NoticeKind::PayloadDropped, &alice).await;
    assert!(notice.detail.is_some_and(|d| d.contains("mallory")));
    assert!(mesh.store.offline_entries().is_empty());
}

#[tokio::test]
async fn sync_reports_unavailable_store() {
    let mesh = Mesh::new();
    let bob = mesh.started("bob");
    mesh.store.set_available(false);

    let result = bob.service.sync_offline_messages().await;
    assert!(matches!(result, Err(StoreError::Unavailable(_))));
}

#[tokio::test]
async fn heartbeat_records_user_online_and_stop_records_offline() {
    let mesh = Mesh::new();
    let mut config = test_config();
    config.signaling.user_id = Some(UserId::new("user-b"));
    config.presence.heartbeat_interval = Duration::from_millis(30);

    let bob = mesh.started_with("bob", &config);
    let user = UserId::new("user-b");

    timeout(WAIT, async {
        while mesh.store.status_updates().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("heartbeats never recorded");
    assert!(
        mesh.store
            .status_updates()
            .iter()
            .all(|update| *update == (user.clone(), PresenceStatus::Online))
    );

    bob.service.stop().await;
    assert_eq!(
        mesh.store.status_updates().last(),
        Some(&(user, PresenceStatus::Offline))
    );

    let count = mesh.store.status_updates().len();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(mesh.store.status_updates().len(), count);
}

#[tokio::test]
async fn no_status_updates_without_user() {
    let mesh = Mesh::new();
    let mut config = test_config();
    config.presence.heartbeat_interval = Duration::from_millis(20);

    let bob = mesh.started_with("bob", &config);
    tokio::time::sleep(Duration::from_millis(100)).await;
    bob.service.stop().await;

    assert!(mesh.store.status_updates().is_empty());
}
