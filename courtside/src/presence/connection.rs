//! WebSocket client for the `courtside-presence` server.
//!
//! [`PresenceConnection::start`] spawns a supervisor task that owns the
//! socket. Each session:
//! 1. Connects to the server URL (10s timeout)
//! 2. Sends `Hello` and waits for `Welcome` (5s timeout)
//! 3. Reports [`ConnectionEvent::Connected`]
//! 4. Heartbeats, forwards outgoing frames, and dispatches server events
//!    until the socket closes
//!
//! When a session ends the supervisor reports
//! [`ConnectionEvent::Disconnected`] and retries with exponential backoff.
//! Snapshot requests are correlated with their answers by request id and
//! fail with [`PresenceError::Closed`] if the session ends first.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use courtside_proto::codec;
use courtside_proto::message::UserId;
use courtside_proto::presence::{PresenceEvent, PresenceFrame};

use super::{ConnectionEvent, PresenceError, PresenceTransport};
use crate::config::ReconnectConfig;

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Default timeout for connecting to the presence server.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for waiting for a `Welcome` acknowledgment from the server.
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

/// Pending snapshot requests keyed by request id.
type PendingSnapshots = Arc<Mutex<HashMap<u64, oneshot::Sender<Vec<(UserId, bool)>>>>>;

/// Connection tuning.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Interval between heartbeats.
    pub heartbeat: Duration,
    /// How long to wait for a snapshot answer.
    pub snapshot_timeout: Duration,
    /// Reconnect backoff.
    pub reconnect: ReconnectConfig,
    /// Capacity of the [`ConnectionEvent`] channel.
    pub event_buffer: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(30),
            snapshot_timeout: Duration::from_secs(5),
            reconnect: ReconnectConfig::default(),
            event_buffer: 256,
        }
    }
}

/// Reconnecting presence client implementing [`PresenceTransport`].
pub struct PresenceConnection {
    user_id: UserId,
    outgoing: mpsc::UnboundedSender<PresenceFrame>,
    pending: PendingSnapshots,
    next_request: AtomicU64,
    connected: Arc<AtomicBool>,
    snapshot_timeout: Duration,
    shutdown: watch::Sender<bool>,
    supervisor: JoinHandle<()>,
}

impl PresenceConnection {
    /// Validate `url` and start the connection supervisor.
    ///
    /// Returns immediately; the first session is reported on the event
    /// channel as `Connected { reconnect: false }`.
    ///
    /// # Errors
    ///
    /// Returns [`PresenceError::InvalidUrl`] if `url` is not a `ws://` or
    /// `wss://` URL.
    pub fn start(
        url: &str,
        user_id: UserId,
        config: ConnectionConfig,
    ) -> Result<(Self, mpsc::Receiver<ConnectionEvent>), PresenceError> {
        let parsed = url::Url::parse(url).map_err(|e| PresenceError::InvalidUrl(format!("{url}: {e}")))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(PresenceError::InvalidUrl(format!(
                "{url}: scheme must be ws or wss"
            )));
        }

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let pending: PendingSnapshots = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(false));

        let supervisor = Supervisor {
            url: url.to_string(),
            user_id: user_id.clone(),
            heartbeat: config.heartbeat,
            reconnect: config.reconnect,
            outgoing: outgoing_rx,
            events: event_tx,
            pending: Arc::clone(&pending),
            connected: Arc::clone(&connected),
            shutdown: shutdown_rx,
        };

        Ok((
            Self {
                user_id,
                outgoing,
                pending,
                next_request: AtomicU64::new(1),
                connected,
                snapshot_timeout: config.snapshot_timeout,
                shutdown,
                supervisor: tokio::spawn(supervisor.run()),
            },
            event_rx,
        ))
    }

    /// The user this connection speaks for.
    pub const fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Whether a session is currently established.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Tell the server this user logged out. The user goes offline for
    /// everyone immediately.
    ///
    /// # Errors
    ///
    /// Returns [`PresenceError::NotConnected`] if no session is up.
    pub fn logout(&self) -> Result<(), PresenceError> {
        self.send_frame(PresenceFrame::Logout)
    }

    /// Stop the supervisor and close the socket.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        let _ = (&mut self.supervisor).await;
    }

    fn send_frame(&self, frame: PresenceFrame) -> Result<(), PresenceError> {
        if !self.is_connected() {
            return Err(PresenceError::NotConnected);
        }
        self.outgoing.send(frame).map_err(|_| PresenceError::Closed)
    }
}

impl PresenceTransport for PresenceConnection {
    async fn subscribe(&self, ids: Vec<UserId>) -> Result<(), PresenceError> {
        self.send_frame(PresenceFrame::Subscribe { ids })
    }

    async fn snapshot(&self, ids: Vec<UserId>) -> Result<HashMap<UserId, bool>, PresenceError> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);

        if let Err(e) = self.send_frame(PresenceFrame::Snapshot { request_id, ids }) {
            self.pending.lock().remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.snapshot_timeout, rx).await {
            Ok(Ok(statuses)) => Ok(statuses.into_iter().collect()),
            Ok(Err(_)) => Err(PresenceError::Closed),
            Err(_) => {
                self.pending.lock().remove(&request_id);
                Err(PresenceError::Timeout)
            }
        }
    }
}

impl Drop for PresenceConnection {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Why a session ended.
enum SessionEnd {
    /// The socket closed or failed; reconnect.
    Lost,
    /// Shutdown was requested; stop.
    Shutdown,
}

/// State owned by the background supervisor task.
struct Supervisor {
    url: String,
    user_id: UserId,
    heartbeat: Duration,
    reconnect: ReconnectConfig,
    outgoing: mpsc::UnboundedReceiver<PresenceFrame>,
    events: mpsc::Sender<ConnectionEvent>,
    pending: PendingSnapshots,
    connected: Arc<AtomicBool>,
    shutdown: watch::Receiver<bool>,
}

impl Supervisor {
    async fn run(mut self) {
        let mut sessions: u64 = 0;
        let mut failures: u32 = 0;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            match open_session(&self.url, &self.user_id).await {
                Ok((sink, reader)) => {
                    failures = 0;
                    self.connected.store(true, Ordering::Relaxed);
                    if sessions > 0 {
                        tracing::info!(url = %self.url, "reconnected to presence server");
                    }
                    let _ = self
                        .events
                        .send(ConnectionEvent::Connected {
                            reconnect: sessions > 0,
                        })
                        .await;
                    sessions += 1;

                    let end = self.run_session(sink, reader).await;

                    self.connected.store(false, Ordering::Relaxed);
                    // Dropping the senders fails outstanding snapshot requests.
                    self.pending.lock().clear();
                    let _ = self.events.send(ConnectionEvent::Disconnected).await;
                    if matches!(end, SessionEnd::Shutdown) {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(url = %self.url, error = %e, "presence connect failed");
                }
            }

            failures += 1;
            if self
                .reconnect
                .max_attempts
                .is_some_and(|max| failures > max)
            {
                tracing::warn!(attempts = failures, "giving up on presence server");
                break;
            }
            let delay = self.reconnect.delay_for(failures);
            tracing::debug!(?delay, attempt = failures, "presence reconnect scheduled");
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                _ = self.shutdown.changed() => break,
            }
        }
        tracing::info!("presence supervisor exiting");
    }

    async fn run_session(&mut self, mut sink: WsSender, mut reader: WsReader) -> SessionEnd {
        let mut heartbeat =
            tokio::time::interval_at(tokio::time::Instant::now() + self.heartbeat, self.heartbeat);

        loop {
            let frame = tokio::select! {
                _ = self.shutdown.changed() => {
                    let _ = sink.close().await;
                    return SessionEnd::Shutdown;
                }
                _ = heartbeat.tick() => PresenceFrame::Heartbeat,
                frame = self.outgoing.recv() => match frame {
                    Some(frame) => frame,
                    None => {
                        let _ = sink.close().await;
                        return SessionEnd::Shutdown;
                    }
                },
                msg = reader.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => self.dispatch(&data).await,
                        Some(Ok(Message::Close(_))) | None => {
                            tracing::info!("presence server closed the connection");
                            return SessionEnd::Lost;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "presence socket read error");
                            return SessionEnd::Lost;
                        }
                    }
                    continue;
                }
            };

            let bytes = match codec::encode_frame(&frame) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to encode presence frame");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Binary(bytes.into())).await {
                tracing::warn!(error = %e, "presence socket write error");
                return SessionEnd::Lost;
            }
        }
    }

    async fn dispatch(&self, data: &[u8]) {
        match codec::decode_event(data) {
            Ok(PresenceEvent::SnapshotResult {
                request_id,
                statuses,
            }) => {
                let waiter = self.pending.lock().remove(&request_id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(statuses);
                    }
                    None => tracing::debug!(request_id, "snapshot answer with no waiter"),
                }
            }
            Ok(event @ (PresenceEvent::Online { .. } | PresenceEvent::Offline { .. })) => {
                let _ = self.events.send(ConnectionEvent::Presence(event)).await;
            }
            Ok(PresenceEvent::Error { reason }) => {
                tracing::warn!(reason = %reason, "presence server error");
            }
            Ok(PresenceEvent::Welcome { .. }) => {
                tracing::debug!("unexpected Welcome mid-session");
            }
            Err(e) => {
                tracing::warn!(error = %e, "malformed presence event, skipping");
            }
        }
    }
}

/// Connect and perform the `Hello` / `Welcome` handshake.
async fn open_session(url: &str, user_id: &UserId) -> Result<(WsSender, WsReader), PresenceError> {
    let (ws_stream, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url))
        .await
        .map_err(|_| PresenceError::Timeout)?
        .map_err(|e| PresenceError::Connect(e.to_string()))?;
    let (mut sink, mut reader) = ws_stream.split();

    let hello = codec::encode_frame(&PresenceFrame::Hello {
        user_id: user_id.clone(),
    })?;
    sink.send(Message::Binary(hello.into()))
        .await
        .map_err(|e| PresenceError::Connect(format!("failed to send Hello: {e}")))?;

    let ack = tokio::time::timeout(HELLO_TIMEOUT, reader.next())
        .await
        .map_err(|_| PresenceError::Timeout)?;

    match ack {
        Some(Ok(Message::Binary(data))) => match codec::decode_event(&data)? {
            PresenceEvent::Welcome { user_id: echoed } => {
                tracing::info!(user_id = %echoed, url, "connected to presence server");
                Ok((sink, reader))
            }
            PresenceEvent::Error { reason } => Err(PresenceError::Handshake(reason)),
            other => Err(PresenceError::Handshake(format!(
                "unexpected response: {other:?}"
            ))),
        },
        Some(Ok(Message::Close(_))) | None => Err(PresenceError::Closed),
        Some(Ok(_)) => Err(PresenceError::Handshake(
            "unexpected non-binary frame".to_string(),
        )),
        Some(Err(e)) => Err(PresenceError::Connect(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_rejects_non_websocket_urls() {
        let result = PresenceConnection::start(
            "http://localhost:9100/presence",
            UserId::new("alice"),
            ConnectionConfig::default(),
        );
        assert!(matches!(result, Err(PresenceError::InvalidUrl(_))));

        let result =
            PresenceConnection::start("not a url", UserId::new("alice"), ConnectionConfig::default());
        assert!(matches!(result, Err(PresenceError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn requests_fail_fast_while_disconnected() {
        let config = ConnectionConfig {
            reconnect: ReconnectConfig {
                max_attempts: Some(0),
                ..ReconnectConfig::default()
            },
            ..ConnectionConfig::default()
        };
        // Nothing listens on port 1.
        let (connection, _events) =
            PresenceConnection::start("ws://127.0.0.1:1/presence", UserId::new("alice"), config)
                .unwrap();

        assert!(!connection.is_connected());
        assert!(matches!(
            connection.subscribe(vec![UserId::new("bob")]).await,
            Err(PresenceError::NotConnected)
        ));
        assert!(matches!(
            connection.snapshot(vec![UserId::new("bob")]).await,
            Err(PresenceError::NotConnected)
        ));
        assert!(connection.pending.lock().is_empty());
        connection.shutdown().await;
    }
}
