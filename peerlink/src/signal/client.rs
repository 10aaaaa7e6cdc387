//! WebSocket signaling client with automatic reconnect.
//!
//! [`SignalingClient::spawn`] starts a supervisor task that owns the
//! connection lifecycle: connect, announce the local peer with a
//! `user_connected` frame, read frames until the socket drops, then back off
//! according to the [`ReconnectPolicy`](super::backoff::ReconnectPolicy) and
//! try again. Every transition is reported as a [`SignalingEvent`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use peerlink_proto::message::PeerId;
use peerlink_proto::signal::{self, SignalMessage};

use super::{SignalSender, SignalingError, SignalingEvent, event_from_message};
use crate::config::SignalingConfig;

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    WsMessage,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Signaling client backed by a relay WebSocket.
///
/// Sends fail with [`SignalingError::NotConnected`] while the supervisor is
/// between connections; callers treat that like any other negotiation
/// failure and rely on the recovery path.
pub struct SignalingClient {
    local_id: PeerId,
    /// Write half of the current connection, if any.
    writer: Arc<Mutex<Option<WsSender>>>,
    connected: Arc<AtomicBool>,
    supervisor: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SignalingClient {
    /// Validate the relay URL and start the connection supervisor.
    ///
    /// Returns immediately; the first [`SignalingEvent::Connected`] (or
    /// [`SignalingEvent::Reconnecting`]) arrives on the returned receiver.
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::Unreachable`] if the URL is not a valid
    /// `ws://` or `wss://` URL.
    pub fn spawn(
        config: SignalingConfig,
        local_id: PeerId,
        buffer: usize,
    ) -> Result<(Self, mpsc::Receiver<SignalingEvent>), SignalingError> {
        let parsed = url::Url::parse(&config.url)
            .map_err(|e| SignalingError::Unreachable(format!("{}: {e}", config.url)))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(SignalingError::Unreachable(format!(
                "unsupported scheme {}",
                parsed.scheme()
            )));
        }

        let (tx, rx) = mpsc::channel(buffer.max(1));
        let writer = Arc::new(Mutex::new(None));
        let connected = Arc::new(AtomicBool::new(false));

        let handle = tokio::spawn(supervise(
            config,
            local_id.clone(),
            Arc::clone(&writer),
            Arc::clone(&connected),
            tx,
        ));

        Ok((
            Self {
                local_id,
                writer,
                connected,
                supervisor: parking_lot::Mutex::new(Some(handle)),
            },
            rx,
        ))
    }

    /// Stop the supervisor and drop the connection. No further events are
    /// delivered.
    pub fn shutdown(&self) {
        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }
        self.connected.store(false, Ordering::Relaxed);
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        tracing::info!(peer = %self.local_id, "signaling client shut down");
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        if let Some(handle) = self.supervisor.get_mut().take() {
            handle.abort();
        }
    }
}

impl SignalSender for SignalingClient {
    async fn send(&self, message: SignalMessage) -> Result<(), SignalingError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(SignalingError::NotConnected);
        }
        let text = signal::encode(&message)?;

        let mut guard = self.writer.lock().await;
        let Some(sink) = guard.as_mut() else {
            return Err(SignalingError::NotConnected);
        };
        sink.send(WsMessage::text(text)).await.map_err(|e| {
            tracing::warn!(error = %e, kind = message.type_name(), "signaling send failed");
            self.connected.store(false, Ordering::Relaxed);
            SignalingError::Io(e.to_string())
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn local_id(&self) -> &PeerId {
        &self.local_id
    }
}

/// Connection lifecycle: connect, read until closed, back off, repeat.
async fn supervise(
    config: SignalingConfig,
    local_id: PeerId,
    writer: Arc<Mutex<Option<WsSender>>>,
    connected: Arc<AtomicBool>,
    events: mpsc::Sender<SignalingEvent>,
) {
    let mut attempt: u32 = 0;
    loop {
        match connect_once(&config, &local_id).await {
            Ok((sink, reader)) => {
                attempt = 0;
                *writer.lock().await = Some(sink);
                connected.store(true, Ordering::Relaxed);
                tracing::info!(url = %config.url, peer = %local_id, "signaling connected");
                if events.send(SignalingEvent::Connected).await.is_err() {
                    return;
                }

                let receiver_alive = reader_loop(reader, &local_id, &events).await;

                connected.store(false, Ordering::Relaxed);
                writer.lock().await.take();
                if !receiver_alive || events.send(SignalingEvent::Disconnected).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(url = %config.url, error = %e, "signaling connect failed");
                let _ = events.try_send(SignalingEvent::Error(e.to_string()));
            }
        }

        attempt += 1;
        if config.reconnect.is_exhausted(attempt) {
            let attempts = attempt - 1;
            tracing::error!(attempts, "signaling reconnect attempts exhausted");
            let _ = events.send(SignalingEvent::Unavailable { attempts }).await;
            return;
        }

        let delay = config.reconnect.delay_for(attempt);
        tracing::info!(attempt, delay_ms = delay.as_millis(), "signaling reconnect scheduled");
        if events
            .send(SignalingEvent::Reconnecting { attempt, delay })
            .await
            .is_err()
        {
            return;
        }
        tokio::time::sleep(delay).await;
    }
}

/// Open the socket and announce ourselves.
async fn connect_once(
    config: &SignalingConfig,
    local_id: &PeerId,
) -> Result<(WsSender, WsReader), SignalingError> {
    let (stream, _response) = tokio::time::timeout(config.connect_timeout, connect_async(&config.url))
        .await
        .map_err(|_| SignalingError::Timeout)?
        .map_err(map_ws_connect_error)?;

    let (mut sink, reader) = stream.split();

    let hello = SignalMessage::UserConnected {
        peer_id: local_id.clone(),
        user_id: config.user_id.clone(),
    };
    sink.send(WsMessage::text(signal::encode(&hello)?))
        .await
        .map_err(|e| SignalingError::Io(format!("failed to announce peer: {e}")))?;

    Ok((sink, reader))
}

/// Read frames until the socket closes. Returns `false` if the event
/// receiver was dropped.
async fn reader_loop(
    mut reader: WsReader,
    local_id: &PeerId,
    events: &mpsc::Sender<SignalingEvent>,
) -> bool {
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => match signal::decode(text.as_str()) {
                Ok(message) => {
                    if let Some(event) = event_from_message(local_id, message)
                        && events.send(event).await.is_err()
                    {
                        return false;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "malformed signaling frame, skipping");
                }
            },
            Ok(WsMessage::Close(_)) => {
                tracing::info!("signaling socket closed by relay");
                break;
            }
            Ok(WsMessage::Binary(_)) => {
                tracing::debug!("ignoring binary signaling frame");
            }
            Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_)) => {}
            Err(e) => {
                tracing::warn!(error = %e, "signaling read error");
                break;
            }
        }
    }
    true
}

/// Map a `tokio_tungstenite` connection error to a [`SignalingError`].
fn map_ws_connect_error(err: tokio_tungstenite::tungstenite::Error) -> SignalingError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => match io_err.kind() {
            std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::AddrNotAvailable => {
                SignalingError::Unreachable(io_err.to_string())
            }
            _ => SignalingError::Io(io_err.to_string()),
        },
        WsError::Http(response) => {
            SignalingError::Io(format!("relay HTTP error: status {}", response.status()))
        }
        other => SignalingError::Io(format!("relay connection error: {other}")),
    }
}
