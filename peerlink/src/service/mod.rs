//! Per-session service wiring every component together.
//!
//! A [`PeerService`] owns the connection manager, the delivery queues, the
//! presence set and the group roster of one local peer. [`start`] spawns the
//! event loop (backend and signaling events), the heartbeat and the
//! connection check; [`stop`] aborts them again. The send pipeline lives in
//! `send`, the receive pipeline in `receive`, event handling in `events` and
//! group fan-out in `group`.
//!
//! [`start`]: PeerService::start
//! [`stop`]: PeerService::stop

mod events;
mod group;
mod receive;
mod send;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use peerlink_proto::message::{Message, PeerId, UserId};
use peerlink_proto::presence::PresenceStatus;

use crate::config::{ClientConfig, DeliveryConfig, PeerConfig, PresenceConfig};
use crate::crypto::CryptoGuard;
use crate::crypto::keys::KeyProvider;
use crate::delivery::batch::InboundBatcher;
use crate::delivery::dedup::DuplicateFilter;
use crate::delivery::pending::PendingQueue;
use crate::group::GroupRoster;
use crate::notice::{NoticeSender, PeerNotice};
use crate::peer::PeerConnectionManager;
use crate::presence::{self, PresenceSet};
use crate::rtc::{PeerRtcEvent, RtcBackend};
use crate::signal::{SignalSender, SignalingEvent};
use crate::store::ExternalStore;

/// Background tasks owned by a running service.
#[derive(Default)]
struct ServiceTasks {
    event_loop: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    connection_check: Option<JoinHandle<()>>,
}

impl ServiceTasks {
    fn abort_all(&mut self) -> bool {
        let mut aborted = false;
        for handle in [
            self.event_loop.take(),
            self.heartbeat.take(),
            self.connection_check.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
            aborted = true;
        }
        aborted
    }
}

/// Peer connection and message delivery for one local peer.
pub struct PeerService<B: RtcBackend, S: SignalSender, St: ExternalStore> {
    local_id: PeerId,
    user_id: Option<UserId>,
    manager: PeerConnectionManager<B, S>,
    store: St,
    crypto: CryptoGuard,
    peer_config: PeerConfig,
    delivery_config: DeliveryConfig,
    presence_config: PresenceConfig,
    pending: PendingQueue,
    presence: PresenceSet,
    roster: GroupRoster,
    seen: parking_lot::Mutex<DuplicateFilter>,
    batcher: InboundBatcher,
    notices: NoticeSender,
    rtc_events: Mutex<mpsc::UnboundedReceiver<PeerRtcEvent>>,
    signal_events: Mutex<mpsc::Receiver<SignalingEvent>>,
    tasks: parking_lot::Mutex<ServiceTasks>,
    recreations: parking_lot::Mutex<HashMap<PeerId, JoinHandle<()>>>,
}

impl<B: RtcBackend, S: SignalSender, St: ExternalStore> PeerService<B, S, St> {
    /// Creates a stopped service.
    ///
    /// The local identity is taken from `signaling`, the authenticated user
    /// (if any) from `config.signaling.user_id`. Returns the service and the
    /// receiver of its notice stream.
    pub fn new(
        backend: B,
        signaling: Arc<S>,
        signal_events: mpsc::Receiver<SignalingEvent>,
        store: St,
        keys: Arc<dyn KeyProvider>,
        config: &ClientConfig,
    ) -> (Arc<Self>, mpsc::Receiver<PeerNotice>) {
        let local_id = signaling.local_id().clone();
        let (notices, notice_rx) = NoticeSender::channel(config.delivery.notice_buffer);
        let (manager, rtc_events) = PeerConnectionManager::new(
            local_id.clone(),
            backend,
            signaling,
            config.peer.clone(),
            notices.clone(),
        );
        let service = Self {
            local_id,
            user_id: config.signaling.user_id.clone(),
            manager,
            store,
            crypto: CryptoGuard::new(keys),
            peer_config: config.peer.clone(),
            delivery_config: config.delivery.clone(),
            presence_config: config.presence.clone(),
            pending: PendingQueue::new(),
            presence: PresenceSet::new(),
            roster: GroupRoster::new(),
            seen: parking_lot::Mutex::new(DuplicateFilter::new(
                config.delivery.max_duplicate_tracking,
            )),
            batcher: InboundBatcher::new(
                config.delivery.batch_size,
                config.delivery.batch_interval,
            ),
            notices,
            rtc_events: Mutex::new(rtc_events),
            signal_events: Mutex::new(signal_events),
            tasks: parking_lot::Mutex::new(ServiceTasks::default()),
            recreations: parking_lot::Mutex::new(HashMap::new()),
        };
        (Arc::new(service), notice_rx)
    }

    /// The local peer identity.
    pub const fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// The connection manager, for inspection.
    pub const fn connections(&self) -> &PeerConnectionManager<B, S> {
        &self.manager
    }

    /// The external store.
    pub const fn store(&self) -> &St {
        &self.store
    }

    /// Groups known to this session.
    pub const fn roster(&self) -> &GroupRoster {
        &self.roster
    }

    /// Last known presence of `peer`.
    pub fn presence_of(&self, peer: &PeerId) -> PresenceStatus {
        self.presence.status(peer)
    }

    /// Number of messages waiting for a channel to `peer`.
    pub fn pending_len(&self, peer: &PeerId) -> usize {
        self.pending.len(peer)
    }

    /// Register a consumer of inbound message batches.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Vec<Message>> {
        self.batcher.subscribe()
    }

    /// Whether the background tasks are running.
    pub fn is_running(&self) -> bool {
        self.tasks.lock().event_loop.is_some()
    }

    /// Spawn the event loop, the heartbeat and the connection check.
    ///
    /// Calling `start` on a running service does nothing.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if tasks.event_loop.is_some() {
            tracing::warn!(peer = %self.local_id, "peer service already started");
            return;
        }

        tasks.event_loop = Some(tokio::spawn(Arc::clone(self).run_event_loop()));
        tasks.heartbeat = Some(tokio::spawn(Arc::clone(self).run_heartbeat()));
        tasks.connection_check = Some(tokio::spawn(Arc::clone(self).run_connection_check()));
        drop(tasks);
        tracing::info!(peer = %self.local_id, "peer service started");
    }

    /// Abort every background task, flush buffered inbound messages and
    /// close every connection. The service can be started again.
    pub async fn stop(&self) {
        let was_running = self.tasks.lock().abort_all();
        for (_, handle) in self.recreations.lock().drain() {
            handle.abort();
        }
        self.batcher.flush();
        self.manager.close_all().await;

        if was_running
            && let Some(user) = &self.user_id
            && let Err(e) = self
                .store
                .update_connection_status(user, PresenceStatus::Offline)
                .await
        {
            tracing::warn!(user = %user.as_str(), error = %e, "failed to record offline status");
        }
        tracing::info!(peer = %self.local_id, "peer service stopped");
    }

    async fn run_event_loop(self: Arc<Self>) {
        let mut rtc_events = self.rtc_events.lock().await;
        let mut signal_events = self.signal_events.lock().await;
        let mut signaling_open = true;

        loop {
            tokio::select! {
                event = rtc_events.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    self.on_rtc_event(event).await;
                }
                event = signal_events.recv(), if signaling_open => {
                    match event {
                        Some(event) => self.on_signal_event(event).await,
                        None => {
                            tracing::debug!("signaling event stream closed");
                            signaling_open = false;
                        }
                    }
                }
            }
        }
    }

    async fn run_heartbeat(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.presence_config.heartbeat_interval);
        loop {
            interval.tick().await;
            if let Err(e) = presence::heartbeat(&self.store, self.user_id.as_ref()).await {
                tracing::warn!(error = %e, "heartbeat failed");
            }
        }
    }

    async fn run_connection_check(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.peer_config.connection_check_interval);
        loop {
            interval.tick().await;
            for peer in self
                .manager
                .stalled(self.peer_config.negotiation_timeout)
                .await
            {
                tracing::warn!(peer = %peer, "negotiation timed out");
                if let Some(action) = self.manager.report_failure(&peer).await {
                    self.run_recovery(peer, action).await;
                }
            }
        }
    }
}
