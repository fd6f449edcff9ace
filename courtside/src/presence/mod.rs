//! Client-side presence: who is online right now.
//!
//! - [`interest::InterestRegistry`] merges the id lists wanted by
//!   independent UI surfaces into one debounced subscription.
//! - [`connection::PresenceConnection`] talks to the presence server over
//!   WebSocket and reconnects on its own.
//! - [`PresenceBoard`] keeps the last known online flag per user.
//!
//! A failed snapshot never clears what the board knows; stale is preferred
//! over flicker.

pub mod connection;
pub mod interest;

use std::collections::HashMap;

use parking_lot::RwLock;

use courtside_proto::codec::CodecError;
use courtside_proto::message::UserId;
use courtside_proto::presence::PresenceEvent;

/// Errors that can occur on the presence transport.
#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    /// No live connection to the presence server.
    #[error("not connected to the presence server")]
    NotConnected,

    /// The server did not answer in time.
    #[error("presence request timed out")]
    Timeout,

    /// The connection closed while a request was outstanding.
    #[error("presence connection closed")]
    Closed,

    /// The server URL is not a valid `ws://` or `wss://` URL.
    #[error("invalid presence server url: {0}")]
    InvalidUrl(String),

    /// The WebSocket connection could not be established.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The server refused or garbled the `Hello` handshake.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A frame could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// The presence collaborator used by the interest registry.
///
/// Implementations include:
/// - [`connection::PresenceConnection`]: WebSocket client for `courtside-presence`
pub trait PresenceTransport: Send + Sync + 'static {
    /// Replace the pushed subscription with `ids`.
    fn subscribe(
        &self,
        ids: Vec<UserId>,
    ) -> impl std::future::Future<Output = Result<(), PresenceError>> + Send;

    /// Ask for the current online state of `ids`.
    fn snapshot(
        &self,
        ids: Vec<UserId>,
    ) -> impl std::future::Future<Output = Result<HashMap<UserId, bool>, PresenceError>> + Send;
}

impl<T: PresenceTransport> PresenceTransport for std::sync::Arc<T> {
    async fn subscribe(&self, ids: Vec<UserId>) -> Result<(), PresenceError> {
        (**self).subscribe(ids).await
    }

    async fn snapshot(&self, ids: Vec<UserId>) -> Result<HashMap<UserId, bool>, PresenceError> {
        (**self).snapshot(ids).await
    }
}

/// Lifecycle and push notifications from a presence connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection is up. `reconnect` is `false` for the first session
    /// and `true` for every later one.
    Connected {
        /// Whether an earlier session existed.
        reconnect: bool,
    },
    /// The connection dropped; the supervisor is retrying.
    Disconnected,
    /// An online/offline push from the server.
    Presence(PresenceEvent),
}

/// Last known online state per user.
#[derive(Debug, Default)]
pub struct PresenceBoard {
    states: RwLock<HashMap<UserId, bool>>,
}

impl PresenceBoard {
    /// Create an empty board.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Last known state of a user; `None` if nothing is known yet.
    pub fn is_online(&self, id: &UserId) -> Option<bool> {
        self.states.read().get(id).copied()
    }

    /// Users currently known to be online, sorted.
    pub fn online(&self) -> Vec<UserId> {
        let mut ids: Vec<UserId> = self
            .states
            .read()
            .iter()
            .filter(|(_, online)| **online)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Apply a pushed event. Returns the users whose state changed.
    pub fn apply(&self, event: &PresenceEvent) -> Vec<(UserId, bool)> {
        match event {
            PresenceEvent::Online { ids } => self.set_many(ids.iter().map(|id| (id.clone(), true))),
            PresenceEvent::Offline { ids } => {
                self.set_many(ids.iter().map(|id| (id.clone(), false)))
            }
            PresenceEvent::SnapshotResult { statuses, .. } => self.set_many(statuses.iter().cloned()),
            PresenceEvent::Welcome { .. } | PresenceEvent::Error { .. } => Vec::new(),
        }
    }

    /// Apply a snapshot answer. Returns the users whose state changed.
    pub fn apply_snapshot(&self, statuses: HashMap<UserId, bool>) -> Vec<(UserId, bool)> {
        self.set_many(statuses)
    }

    fn set_many(&self, updates: impl IntoIterator<Item = (UserId, bool)>) -> Vec<(UserId, bool)> {
        let mut states = self.states.write();
        updates
            .into_iter()
            .filter(|(id, online)| states.insert(id.clone(), *online) != Some(*online))
            .collect()
    }
}
