//! Presence wire protocol between clients and the presence server.
//!
//! A client opens a WebSocket, sends [`PresenceFrame::Hello`] and waits for
//! [`PresenceEvent::Welcome`]. After that it heartbeats to stay online,
//! replaces its subscription with [`PresenceFrame::Subscribe`], and may ask
//! for a point-in-time [`PresenceFrame::Snapshot`]. The server pushes
//! edge-triggered [`PresenceEvent::Online`] / [`PresenceEvent::Offline`]
//! batches filtered by the connection's subscription.

use serde::{Deserialize, Serialize};

use crate::message::UserId;

/// Frames sent by a client to the presence server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceFrame {
    /// Identifies the connecting user. Must be the first frame.
    Hello {
        /// The authenticated user behind this connection.
        user_id: UserId,
    },
    /// Activity heartbeat for the connection's user.
    Heartbeat,
    /// Replaces the connection's subscription with `ids`.
    Subscribe {
        /// Users whose online/offline transitions should be pushed.
        ids: Vec<UserId>,
    },
    /// Requests the current online state of `ids`.
    Snapshot {
        /// Correlates the answer with this request.
        request_id: u64,
        /// Users to report on.
        ids: Vec<UserId>,
    },
    /// Explicit logout: the user goes offline immediately.
    Logout,
}

/// Events pushed by the presence server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceEvent {
    /// Acknowledges [`PresenceFrame::Hello`].
    Welcome {
        /// The user id that was registered (echoed back).
        user_id: UserId,
    },
    /// Subscribed users that just came online.
    Online {
        /// Users that transitioned offline -> online.
        ids: Vec<UserId>,
    },
    /// Subscribed users that just went offline.
    Offline {
        /// Users that transitioned online -> offline.
        ids: Vec<UserId>,
    },
    /// Answer to [`PresenceFrame::Snapshot`].
    SnapshotResult {
        /// Echo of the request id.
        request_id: u64,
        /// Online flag per requested user.
        statuses: Vec<(UserId, bool)>,
    },
    /// The server rejected a frame.
    Error {
        /// Human-readable error description.
        reason: String,
    },
}
