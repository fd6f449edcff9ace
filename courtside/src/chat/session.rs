//! One user's chat delivery pipeline, wired together.
//!
//! [`ChatSession`] owns the outbox, send coordinator, reconciler and
//! backfill runner for a signed-in user and exposes the operations a chat
//! screen needs: compose, retry, discard, merge the live stream, and catch
//! up after a reconnect.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use courtside_proto::message::{
    ChatContext, ConfirmedMessage, MessageId, MessagePayload, TempId, UserId, ValidationError,
};

use crate::config::ClientConfig;
use crate::outbox::OutboxStore;
use crate::storage::KvStore;
use crate::storage::file::FileKv;
use crate::sync::{Backfill, BackfillSummary, CursorStore, MissedBuffer, UnreadCache};

use super::reconcile::{ConversationView, ReconcileReport, Reconciler};
use super::send::SendCoordinator;
use super::{ChatApi, ChatEvent, SendError, event_channel};

/// The delivery pipeline of one signed-in user.
pub struct ChatSession<A: ChatApi, K: KvStore + 'static> {
    outbox: Arc<OutboxStore<K>>,
    sender: Arc<SendCoordinator<A, K>>,
    reconciler: Reconciler<K>,
    backfill: Backfill<A>,
    cursors: Arc<CursorStore>,
    buffer: Arc<MissedBuffer>,
    unread: Arc<UnreadCache>,
}

impl<A: ChatApi, K: KvStore + 'static> ChatSession<A, K> {
    /// Wire up a session for `self_id` over `api` and durable storage `kv`.
    ///
    /// Returns the session and a receiver for [`ChatEvent`]s that the UI
    /// layer should consume.
    pub fn new(
        api: Arc<A>,
        kv: K,
        self_id: UserId,
        send_deadline: Duration,
        event_buffer: usize,
    ) -> (Self, mpsc::Receiver<ChatEvent>) {
        let (event_tx, event_rx) = event_channel(event_buffer);
        let outbox = Arc::new(OutboxStore::new(kv));
        let cursors = Arc::new(CursorStore::new());
        let buffer = Arc::new(MissedBuffer::new());
        let unread = Arc::new(UnreadCache::new());

        let sender = Arc::new(SendCoordinator::new(
            Arc::clone(&api),
            Arc::clone(&outbox),
            send_deadline,
            event_tx.clone(),
        ));
        let reconciler = Reconciler::new(
            Arc::clone(&outbox),
            Arc::clone(&cursors),
            self_id,
            event_tx.clone(),
        );
        let backfill = Backfill::new(
            api,
            Arc::clone(&cursors),
            Arc::clone(&buffer),
            Arc::clone(&unread),
            event_tx,
        );

        let session = Self {
            outbox,
            sender,
            reconciler,
            backfill,
            cursors,
            buffer,
            unread,
        };
        (session, event_rx)
    }

    /// The durable outbox.
    pub const fn outbox(&self) -> &Arc<OutboxStore<K>> {
        &self.outbox
    }

    /// The send coordinator.
    pub const fn sender(&self) -> &Arc<SendCoordinator<A, K>> {
        &self.sender
    }

    /// Per-conversation sync cursors.
    pub const fn cursors(&self) -> &Arc<CursorStore> {
        &self.cursors
    }

    /// Cached unread counters.
    pub const fn unread(&self) -> &Arc<UnreadCache> {
        &self.unread
    }

    /// Open a conversation: restore its outbox placeholders, resume
    /// interrupted sends and merge anything already backfilled.
    pub async fn open(&self, view: &mut ConversationView) -> ReconcileReport {
        self.sender.resume(view.context()).await;
        self.reconciler.drain_backfill(view, &self.buffer).await
    }

    /// Queue a message, render it optimistically and start sending it.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if the payload cannot be sent at all.
    pub async fn compose(
        &self,
        view: &mut ConversationView,
        payload: MessagePayload,
    ) -> Result<(TempId, JoinHandle<Result<MessageId, SendError>>), ValidationError> {
        let temp_id = self.outbox.append(view.context(), payload).await?;
        self.reconciler.refresh_placeholders(view).await;
        let attempt = self.sender.dispatch(view.context(), temp_id);
        Ok((temp_id, attempt))
    }

    /// Manually retry a failed message and refresh the view afterwards.
    ///
    /// # Errors
    ///
    /// Same as [`SendCoordinator::retry`].
    pub async fn retry(
        &self,
        view: &mut ConversationView,
        temp_id: TempId,
    ) -> Result<MessageId, SendError> {
        let result = self.sender.retry(view.context(), temp_id).await;
        self.reconciler.refresh_placeholders(view).await;
        result
    }

    /// Remove a message from the queue without sending it.
    pub async fn discard(&self, view: &mut ConversationView, temp_id: TempId) -> bool {
        let removed = self.sender.discard(view.context(), temp_id).await;
        self.reconciler.refresh_placeholders(view).await;
        removed
    }

    /// Merge messages pushed on the authoritative stream.
    pub async fn on_stream(
        &self,
        view: &mut ConversationView,
        messages: Vec<ConfirmedMessage>,
    ) -> ReconcileReport {
        self.reconciler.ingest(view, messages).await
    }

    /// Re-read the outbox into the view's placeholders.
    pub async fn refresh(&self, view: &mut ConversationView) {
        self.reconciler.refresh_placeholders(view).await;
    }

    /// Catch up on conversations after a reconnect. Fetched messages are
    /// buffered until [`merge_backfill`](Self::merge_backfill) or
    /// [`open`](Self::open).
    pub async fn reconnect(&self, contexts: &[ChatContext]) -> BackfillSummary {
        self.backfill.run(contexts).await
    }

    /// Merge buffered backfill into an open view.
    pub async fn merge_backfill(&self, view: &mut ConversationView) -> ReconcileReport {
        self.reconciler.drain_backfill(view, &self.buffer).await
    }

    /// Leave a conversation: stop watching its in-flight sends.
    pub fn leave(&self, context: &ChatContext) -> usize {
        self.sender.cancel_all_for_context(context)
    }
}

impl<A: ChatApi> ChatSession<A, FileKv> {
    /// Wire up a session with the outbox under `config.storage_dir` and the
    /// configured send deadline and event buffer.
    pub fn from_config(
        api: Arc<A>,
        self_id: UserId,
        config: &ClientConfig,
    ) -> (Self, mpsc::Receiver<ChatEvent>) {
        tracing::debug!(
            user_id = %self_id,
            dir = %config.storage_dir.display(),
            "opening chat session"
        );
        Self::new(
            api,
            FileKv::new(config.storage_dir.clone()),
            self_id,
            config.send_deadline,
            config.event_buffer,
        )
    }
}
