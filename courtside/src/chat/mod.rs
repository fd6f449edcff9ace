//! Chat delivery layer for Courtside.
//!
//! Ties the [`outbox`](crate::outbox) to the server's message-creation call
//! and to the authoritative message stream:
//!
//! - [`send::SendCoordinator`] runs one deadline-bounded attempt per queued
//!   message and records the outcome in the outbox.
//! - [`reconcile::Reconciler`] matches confirmed messages against outbox
//!   entries and maintains the per-conversation display view.
//! - [`session::ChatSession`] wires the pieces together for one user.
//! - [`memory::InMemoryChatServer`] stands in for the remote chat API in
//!   tests and in the demo binary.
//!
//! Components report what happened through [`ChatEvent`]s on a shared
//! channel created with [`event_channel`].

pub mod memory;
pub mod reconcile;
pub mod send;
pub mod session;

use std::time::Duration;

use tokio::sync::mpsc;

use courtside_proto::message::{ChatContext, ConfirmedMessage, MessageId, MessagePayload, TempId};

/// Errors returned by the remote chat API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// The server refused the request.
    #[error("rejected by server: {0}")]
    Rejected(String),

    /// The server could not be reached.
    #[error("network error: {0}")]
    Network(String),
}

/// Errors that can occur when sending a queued message.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// No confirmation arrived before the deadline.
    #[error("send timed out after {0:?}")]
    Timeout(Duration),

    /// The create call failed.
    #[error("create failed: {0}")]
    Rejected(#[from] ApiError),

    /// An attempt for this entry is already running.
    #[error("{0} is already being sent")]
    AlreadyInFlight(TempId),

    /// The entry is not in the outbox.
    #[error("{0} is not in the outbox")]
    UnknownEntry(TempId),

    /// Only `failed` entries can be retried.
    #[error("{0} has not failed and cannot be retried")]
    NotFailed(TempId),

    /// The attempt was cancelled locally.
    #[error("send of {0} was cancelled")]
    Cancelled(TempId),
}

/// Remote chat API used by the delivery layer.
///
/// Implementations include:
/// - [`memory::InMemoryChatServer`]: in-process server for tests and demos
pub trait ChatApi: Send + Sync + 'static {
    /// Create a message on the server and return its confirmed form.
    fn create_message(
        &self,
        context: &ChatContext,
        payload: &MessagePayload,
    ) -> impl std::future::Future<Output = Result<ConfirmedMessage, ApiError>> + Send;

    /// Fetch confirmed messages of `context` newer than `after`, ascending.
    /// `None` fetches from the beginning.
    fn missed_messages(
        &self,
        context: &ChatContext,
        after: Option<&MessageId>,
    ) -> impl std::future::Future<Output = Result<Vec<ConfirmedMessage>, ApiError>> + Send;
}

impl<T: ChatApi> ChatApi for std::sync::Arc<T> {
    async fn create_message(
        &self,
        context: &ChatContext,
        payload: &MessagePayload,
    ) -> Result<ConfirmedMessage, ApiError> {
        (**self).create_message(context, payload).await
    }

    async fn missed_messages(
        &self,
        context: &ChatContext,
        after: Option<&MessageId>,
    ) -> Result<Vec<ConfirmedMessage>, ApiError> {
        (**self).missed_messages(context, after).await
    }
}

/// Events emitted by the delivery layer for UI notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// The server accepted a queued message. The entry stays in the outbox
    /// until the confirmed copy is reconciled.
    SendAccepted {
        /// Conversation of the entry.
        context: ChatContext,
        /// The entry that was accepted.
        temp_id: TempId,
        /// Server id of the created message.
        message_id: MessageId,
    },
    /// A send attempt timed out or was rejected; the entry is now failed.
    SendFailed {
        /// Conversation of the entry.
        context: ChatContext,
        /// The entry that failed.
        temp_id: TempId,
        /// Why the attempt failed.
        reason: String,
    },
    /// Confirmed messages replaced outbox entries.
    OutboxReconciled {
        /// Conversation that was reconciled.
        context: ChatContext,
        /// Entries removed from the outbox.
        matched: Vec<TempId>,
    },
    /// Missed messages were fetched and are waiting to be merged.
    BackfillReady {
        /// Conversation with new messages.
        context: ChatContext,
        /// Number of buffered messages.
        count: usize,
    },
    /// Unread counters were invalidated and should be refetched.
    UnreadRefreshRequested,
}

/// Create the shared event channel for delivery-layer components.
#[must_use]
pub fn event_channel(buffer: usize) -> (mpsc::Sender<ChatEvent>, mpsc::Receiver<ChatEvent>) {
    mpsc::channel(buffer)
}
