//! Relay server core: shared state, WebSocket handler, peer registry,
//! presence broadcast and signal routing.
//!
//! Each peer opens one WebSocket and announces itself with a
//! `user_connected` frame. From then on the relay tells it who else is
//! online, broadcasts its own arrival and departure, and forwards offers,
//! answers and ICE candidates to the peer named in `recipientId`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use peerlink_proto::message::{PeerId, UserId};
use peerlink_proto::presence::PresenceStatus;
use peerlink_proto::signal::{self, SignalMessage};
use tokio::sync::{RwLock, mpsc};

use crate::config::DEFAULT_MAX_MESSAGE_SIZE;

struct Registration {
    sender: mpsc::UnboundedSender<Message>,
    user_id: Option<UserId>,
    conn_id: u64,
}

/// Shared relay state holding the peer registry.
pub struct RelayState {
    connections: RwLock<HashMap<PeerId, Registration>>,
    next_conn_id: AtomicU64,
    max_message_size: usize,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayState {
    /// Creates an empty registry with the default frame size limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_message_size(DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Creates an empty registry that rejects frames above `max_message_size`.
    #[must_use]
    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            max_message_size,
        }
    }

    /// Registers a connection for `peer`.
    ///
    /// Returns the connection id to pass to [`unregister`](Self::unregister)
    /// and whether an older connection for the same peer was replaced. The
    /// replaced connection's writer sees its channel close and shuts down.
    pub async fn register(
        &self,
        peer: &PeerId,
        user_id: Option<UserId>,
        sender: mpsc::UnboundedSender<Message>,
    ) -> (u64, bool) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let previous = self.connections.write().await.insert(
            peer.clone(),
            Registration {
                sender,
                user_id,
                conn_id,
            },
        );
        (conn_id, previous.is_some())
    }

    /// Removes `peer` if it is still registered under `conn_id`.
    ///
    /// A connection that was replaced by a newer one leaves the newer
    /// registration alone and returns `false`.
    pub async fn unregister(&self, peer: &PeerId, conn_id: u64) -> bool {
        let mut conns = self.connections.write().await;
        if conns.get(peer).is_some_and(|r| r.conn_id == conn_id) {
            conns.remove(peer);
            true
        } else {
            false
        }
    }

    /// Returns a clone of the sender for `peer`, if registered.
    pub async fn get_sender(&self, peer: &PeerId) -> Option<mpsc::UnboundedSender<Message>> {
        self.connections
            .read()
            .await
            .get(peer)
            .map(|r| r.sender.clone())
    }

    /// Whether `peer` currently has a registered connection.
    pub async fn is_registered(&self, peer: &PeerId) -> bool {
        self.connections.read().await.contains_key(peer)
    }

    /// Registered peers and their users, sorted by peer id.
    pub async fn online_peers(&self) -> Vec<(PeerId, Option<UserId>)> {
        let mut peers: Vec<_> = self
            .connections
            .read()
            .await
            .iter()
            .map(|(peer, r)| (peer.clone(), r.user_id.clone()))
            .collect();
        peers.sort_by(|a, b| a.0.cmp(&b.0));
        peers
    }

    /// Sends `msg` to every registered peer except `except`.
    pub async fn broadcast_except(&self, except: &PeerId, msg: &SignalMessage) {
        let text = match signal::encode(msg) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode broadcast");
                return;
            }
        };
        let conns = self.connections.read().await;
        for (peer, registration) in conns.iter().filter(|(peer, _)| *peer != except) {
            if registration
                .sender
                .send(Message::Text(text.clone().into()))
                .is_err()
            {
                tracing::debug!(peer = %peer, "broadcast to closing connection skipped");
            }
        }
    }

    /// Send a WebSocket Close frame to every registered peer. Used on
    /// shutdown; each socket task then unregisters its peer.
    pub async fn close_all_connections(&self) {
        let conns = self.connections.read().await;
        for (peer, registration) in conns.iter() {
            tracing::info!(peer = %peer, "sending close frame to peer");
            let _ = registration.sender.send(Message::Close(None));
        }
    }
}

/// Handles an upgraded WebSocket connection for a single peer.
///
/// 1. Wait for `user_connected`.
/// 2. Register the peer and send it the current online set.
/// 3. Broadcast its arrival.
/// 4. Route its frames until the socket closes.
/// 5. Unregister and broadcast its departure, unless a newer connection
///    for the same peer took over.
pub async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let Some((peer_id, user_id)) = wait_for_hello(&mut ws_receiver, state.max_message_size).await
    else {
        tracing::warn!("connection closed before user_connected");
        return;
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let (conn_id, replaced) = state.register(&peer_id, user_id.clone(), tx).await;
    if replaced {
        tracing::info!(peer = %peer_id, "replaced existing connection");
    }
    tracing::info!(peer = %peer_id, user = ?user_id, "peer registered");

    for (peer, user) in state.online_peers().await {
        if peer == peer_id {
            continue;
        }
        let frame = status_frame(peer, user, PresenceStatus::Online);
        if let Err(e) = send_signal(&mut ws_sender, &frame).await {
            tracing::warn!(peer = %peer_id, error = %e, "failed to send online set");
            state.unregister(&peer_id, conn_id).await;
            return;
        }
    }

    state
        .broadcast_except(
            &peer_id,
            &status_frame(peer_id.clone(), user_id.clone(), PresenceStatus::Online),
        )
        .await;

    let writer_peer = peer_id.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(peer = %writer_peer, "WebSocket write failed");
                break;
            }
        }
    });

    let reader_peer = peer_id.clone();
    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    handle_text_frame(&reader_peer, text.as_str(), &reader_state).await;
                }
                Message::Binary(data) => {
                    tracing::warn!(peer = %reader_peer, len = data.len(), "ignoring binary frame");
                }
                Message::Close(_) => {
                    tracing::info!(peer = %reader_peer, "received close frame");
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    if state.unregister(&peer_id, conn_id).await {
        state
            .broadcast_except(
                &peer_id,
                &status_frame(peer_id.clone(), user_id, PresenceStatus::Offline),
            )
            .await;
        tracing::info!(peer = %peer_id, "peer disconnected and unregistered");
    } else {
        tracing::debug!(peer = %peer_id, "superseded connection closed");
    }
}

/// Waits for the `user_connected` frame that opens every connection.
///
/// Returns `None` if the socket closes or anything else arrives first.
async fn wait_for_hello(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    max_message_size: usize,
) -> Option<(PeerId, Option<UserId>)> {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => {
                if text.as_str().len() > max_message_size {
                    tracing::warn!(size = text.as_str().len(), "oversized first frame");
                    return None;
                }
                return match signal::decode(text.as_str()) {
                    Ok(SignalMessage::UserConnected { peer_id, user_id }) => {
                        if peer_id.as_str().is_empty() {
                            tracing::warn!("user_connected with empty peer id");
                            return None;
                        }
                        Some((peer_id, user_id))
                    }
                    Ok(other) => {
                        tracing::warn!(kind = other.type_name(), "expected user_connected");
                        None
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to decode first frame");
                        None
                    }
                };
            }
            Message::Binary(_) | Message::Close(_) => return None,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
    None
}

/// Handles a text frame from a registered peer.
async fn handle_text_frame(peer_id: &PeerId, text: &str, state: &Arc<RelayState>) {
    if text.len() > state.max_message_size {
        tracing::warn!(
            peer = %peer_id,
            size = text.len(),
            max = state.max_message_size,
            "frame exceeds size limit"
        );
        return;
    }

    let msg = match signal::decode(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(peer = %peer_id, error = %e, "failed to decode frame");
            return;
        }
    };

    match msg {
        SignalMessage::Offer { .. }
        | SignalMessage::Answer { .. }
        | SignalMessage::IceCandidate { .. } => {
            // Sender is always the registered identity of this socket.
            route_signal(state, peer_id, msg.with_sender(peer_id.clone())).await;
        }
        SignalMessage::UserConnected { peer_id: new_id, .. } => {
            tracing::warn!(
                peer = %peer_id,
                new_id = %new_id,
                "duplicate user_connected from registered peer"
            );
        }
        SignalMessage::UserStatusChange { .. } => {
            tracing::warn!(peer = %peer_id, "clients may not announce presence");
        }
    }
}

/// Forwards a routed frame to its recipient, dropping it if the recipient
/// is not connected.
async fn route_signal(state: &Arc<RelayState>, from: &PeerId, msg: SignalMessage) {
    let Some(to) = msg.recipient() else {
        return;
    };
    let Some(sender) = state.get_sender(to).await else {
        tracing::warn!(
            from = %from,
            to = %to,
            kind = msg.type_name(),
            "recipient not connected, dropping"
        );
        return;
    };

    tracing::debug!(from = %from, to = %to, kind = msg.type_name(), "routing signal");
    match signal::encode(&msg) {
        Ok(text) => {
            if sender.send(Message::Text(text.into())).is_err() {
                tracing::warn!(to = %to, "forward failed, recipient closing");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to encode routed frame");
        }
    }
}

const fn status_frame(
    peer: PeerId,
    user_id: Option<UserId>,
    status: PresenceStatus,
) -> SignalMessage {
    SignalMessage::UserStatusChange {
        user_id,
        peer_id: Some(peer),
        status,
    }
}

/// Encodes and sends a frame directly on a WebSocket sender.
async fn send_signal(
    ws_sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    msg: &SignalMessage,
) -> Result<(), String> {
    let text = signal::encode(msg).map_err(|e| e.to_string())?;
    ws_sender
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| format!("WebSocket send error: {e}"))
}

/// Starts the relay on `addr` with default limits and returns the bound
/// address and a join handle.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(RelayState::new())).await
}

/// Starts the relay with a pre-configured [`RelayState`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<RelayState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "relay server error");
        }
    });

    Ok((bound_addr, handle))
}

async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<RelayState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}
