//! Presence server core: shared state, WebSocket handler and fan-out.
//!
//! Each WebSocket connection identifies its user with a `Hello` frame and
//! then heartbeats to keep that user online in the [`PresenceTracker`].
//! A connection replaces its subscription with `Subscribe`; tracker
//! transitions are pushed only to connections subscribed to the user.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::{Message, WebSocket};
use courtside_proto::codec;
use courtside_proto::message::UserId;
use courtside_proto::presence::{PresenceEvent, PresenceFrame};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{RwLock, mpsc};

use crate::tracker::{PresenceChange, PresenceTracker, TrackerConfig, TrackerError};

/// Default maximum number of ids one connection may subscribe to.
pub const DEFAULT_MAX_SUBSCRIPTION: usize = 3000;

struct Connection {
    user_id: UserId,
    sender: mpsc::UnboundedSender<Message>,
    subscription: HashSet<UserId>,
}

/// Shared presence server state: the tracker and the live connections.
pub struct PresenceState {
    tracker: Arc<PresenceTracker>,
    connections: RwLock<HashMap<u64, Connection>>,
    next_connection: AtomicU64,
    max_subscription: usize,
}

impl Default for PresenceState {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceState {
    /// State with the default tracker timing and subscription cap.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(TrackerConfig::default(), DEFAULT_MAX_SUBSCRIPTION)
    }

    /// State with custom tracker timing and subscription cap.
    #[must_use]
    pub fn with_config(tracker: TrackerConfig, max_subscription: usize) -> Self {
        Self {
            tracker: Arc::new(PresenceTracker::new(tracker)),
            connections: RwLock::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
            max_subscription,
        }
    }

    /// The authoritative tracker.
    #[must_use]
    pub const fn tracker(&self) -> &Arc<PresenceTracker> {
        &self.tracker
    }

    /// Start the tracker and the task that pushes its transitions to
    /// subscribed connections.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::AlreadyRunning`] if already started.
    pub fn start(self: &Arc<Self>) -> Result<(), TrackerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.tracker.init(tx)?;
        tokio::spawn(fan_out(Arc::clone(self), rx));
        Ok(())
    }

    /// Stop the tracker and close every connection.
    pub async fn shutdown(&self) {
        self.tracker.stop();
        self.close_all_connections().await;
    }

    /// Send a WebSocket Close frame to every connection. The tracker keeps
    /// running, so users stay online until their TTL expires.
    pub async fn close_all_connections(&self) {
        let conns = self.connections.read().await;
        for (id, conn) in conns.iter() {
            tracing::info!(connection = id, user_id = %conn.user_id, "closing connection");
            let _ = conn.sender.send(Message::Close(None));
        }
    }

    /// Number of open connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    async fn register(&self, user_id: UserId, sender: mpsc::UnboundedSender<Message>) -> u64 {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        self.connections.write().await.insert(
            id,
            Connection {
                user_id,
                sender,
                subscription: HashSet::new(),
            },
        );
        id
    }

    async fn unregister(&self, connection: u64) {
        self.connections.write().await.remove(&connection);
    }

    /// Replace a connection's subscription. Returns the ids that were not
    /// subscribed before.
    async fn subscribe(&self, connection: u64, ids: Vec<UserId>) -> Vec<UserId> {
        let mut conns = self.connections.write().await;
        let Some(conn) = conns.get_mut(&connection) else {
            return Vec::new();
        };
        let next: HashSet<UserId> = ids.into_iter().collect();
        let mut added: Vec<UserId> = next.difference(&conn.subscription).cloned().collect();
        added.sort();
        conn.subscription = next;
        added
    }

    async fn send_to(&self, connection: u64, event: &PresenceEvent) {
        if let Some(conn) = self.connections.read().await.get(&connection)
            && let Ok(bytes) = codec::encode_event(event)
        {
            let _ = conn.sender.send(Message::Binary(bytes.into()));
        }
    }

    /// Push a run of same-direction transitions to every connection
    /// subscribed to at least one of the users.
    async fn broadcast(&self, online: bool, ids: &[UserId]) {
        let conns = self.connections.read().await;
        for (id, conn) in conns.iter() {
            let matched: Vec<UserId> = ids
                .iter()
                .filter(|user| conn.subscription.contains(*user))
                .cloned()
                .collect();
            if matched.is_empty() {
                continue;
            }
            let event = if online {
                PresenceEvent::Online { ids: matched }
            } else {
                PresenceEvent::Offline { ids: matched }
            };
            match codec::encode_event(&event) {
                Ok(bytes) => {
                    if conn.sender.send(Message::Binary(bytes.into())).is_err() {
                        tracing::debug!(connection = id, "push to closed connection dropped");
                    }
                }
                Err(e) => tracing::error!(error = %e, "failed to encode presence event"),
            }
        }
    }
}

/// Forward tracker transitions to subscribers, batching whatever is queued.
async fn fan_out(state: Arc<PresenceState>, mut rx: mpsc::UnboundedReceiver<PresenceChange>) {
    while let Some(first) = rx.recv().await {
        let mut run_online = matches!(first, PresenceChange::Online(_));
        let mut batch = vec![first];
        while let Ok(next) = rx.try_recv() {
            batch.push(next);
        }

        // Consecutive changes of the same direction share one event so the
        // final state a subscriber sees matches the tracker.
        let mut run: Vec<UserId> = Vec::new();
        for change in batch {
            let online = matches!(change, PresenceChange::Online(_));
            if online != run_online && !run.is_empty() {
                state.broadcast(run_online, &run).await;
                run.clear();
            }
            run_online = online;
            run.push(change.user_id().clone());
        }
        if !run.is_empty() {
            state.broadcast(run_online, &run).await;
        }
    }
    tracing::debug!("presence fan-out finished");
}

/// Handles an upgraded WebSocket connection.
///
/// The connection lifecycle:
/// 1. Wait for a `Hello` frame.
/// 2. Register the connection, record activity for its user and answer
///    `Welcome`.
/// 3. Process frames until the socket closes.
/// 4. Unregister. The user stays online until the TTL expires.
pub async fn handle_socket(socket: WebSocket, state: Arc<PresenceState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let Some(user_id) = wait_for_hello(&mut ws_receiver).await else {
        tracing::warn!("connection closed before hello");
        return;
    };

    // Pushes queued before the writer starts are sent after the Welcome.
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let connection = state.register(user_id.clone(), tx).await;
    if let Err(e) = state.tracker.record_activity(&user_id) {
        tracing::warn!(user_id = %user_id, error = %e, "activity not recorded");
    }

    let welcome = PresenceEvent::Welcome {
        user_id: user_id.clone(),
    };
    if let Err(e) = send_event(&mut ws_sender, &welcome).await {
        tracing::warn!(user_id = %user_id, error = %e, "failed to send welcome");
        state.unregister(connection).await;
        return;
    }
    tracing::info!(connection, user_id = %user_id, "connection registered");

    let writer_user = user_id.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(user_id = %writer_user, "WebSocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let reader_user = user_id.clone();
    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Binary(data) => {
                    handle_binary_message(connection, &reader_user, &data, &reader_state).await;
                }
                Message::Close(_) => {
                    tracing::info!(user_id = %reader_user, "received close frame");
                    break;
                }
                _ => {}
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

    state.unregister(connection).await;
    tracing::info!(connection, user_id = %user_id, "connection closed");
}

/// Waits for the first binary frame, expecting `Hello`.
async fn wait_for_hello(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Option<UserId> {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Binary(data) => match codec::decode_frame(&data) {
                Ok(PresenceFrame::Hello { user_id }) => {
                    if user_id.as_str().is_empty() {
                        tracing::warn!("received Hello with empty user_id");
                        return None;
                    }
                    return Some(user_id);
                }
                Ok(other) => {
                    tracing::warn!(frame = ?other, "expected Hello, got different frame");
                    return None;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to decode hello frame");
                    return None;
                }
            },
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}

/// Handles a binary frame from a registered connection.
async fn handle_binary_message(
    connection: u64,
    user_id: &UserId,
    data: &[u8],
    state: &Arc<PresenceState>,
) {
    let frame = match codec::decode_frame(data) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(user_id = %user_id, error = %e, "failed to decode frame");
            let err = PresenceEvent::Error {
                reason: format!("undecodable frame: {e}"),
            };
            state.send_to(connection, &err).await;
            return;
        }
    };

    match frame {
        PresenceFrame::Heartbeat => {
            if let Err(e) = state.tracker.record_activity(user_id) {
                tracing::warn!(user_id = %user_id, error = %e, "heartbeat not recorded");
            }
        }
        PresenceFrame::Subscribe { mut ids } => {
            if ids.len() > state.max_subscription {
                tracing::warn!(
                    user_id = %user_id,
                    requested = ids.len(),
                    max = state.max_subscription,
                    "subscription truncated"
                );
                let err = PresenceEvent::Error {
                    reason: format!(
                        "subscription too large: {} ids (max {})",
                        ids.len(),
                        state.max_subscription
                    ),
                };
                state.send_to(connection, &err).await;
                ids.truncate(state.max_subscription);
            }
            let count = ids.len();
            let added = state.subscribe(connection, ids).await;
            tracing::debug!(user_id = %user_id, count, added = added.len(), "subscription replaced");

            // Newly subscribed users that are already online are announced
            // once so the subscriber starts from the current state.
            let online: Vec<UserId> = state
                .tracker
                .snapshot(&added)
                .into_iter()
                .filter_map(|(id, online)| online.then_some(id))
                .collect();
            if !online.is_empty() {
                state
                    .send_to(connection, &PresenceEvent::Online { ids: online })
                    .await;
            }
        }
        PresenceFrame::Snapshot { request_id, ids } => {
            let statuses = state.tracker.snapshot(&ids);
            state
                .send_to(connection, &PresenceEvent::SnapshotResult { request_id, statuses })
                .await;
        }
        PresenceFrame::Logout => {
            state.tracker.logout(user_id);
        }
        PresenceFrame::Hello { user_id: new_id } => {
            tracing::warn!(
                user_id = %user_id,
                new_id = %new_id,
                "received duplicate Hello on registered connection"
            );
        }
    }
}

/// Encodes and sends an event directly on a WebSocket sender.
async fn send_event(
    ws_sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    event: &PresenceEvent,
) -> Result<(), String> {
    let bytes = codec::encode_event(event).map_err(|e| e.to_string())?;
    ws_sender
        .send(Message::Binary(bytes.into()))
        .await
        .map_err(|e| format!("WebSocket send error: {e}"))
}

/// Starts the presence server with default state on `addr`.
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
    start_server_with_state(addr, Arc::new(PresenceState::new())).await
}

/// Starts the presence server with a pre-configured [`PresenceState`].
///
/// The state's tracker is started here; the WebSocket endpoint is served at
/// `/presence`.
///
/// # Errors
///
/// Returns an error if the tracker is already running or the TCP listener
/// cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<PresenceState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;
    state.start()?;

    let app = axum::Router::new()
        .route("/presence", axum::routing::get(ws_handler))
        .with_state(state);

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "presence server error");
        }
    });

    Ok((bound_addr, handle))
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<PresenceState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}
