//! Per-conversation sync cursors and missed-message backfill.
//!
//! - [`CursorStore`] remembers the newest confirmed message merged into each
//!   conversation's view. Cursors only move forward.
//! - [`MissedBuffer`] holds messages fetched out of band until the view
//!   consumes them (consume-once).
//! - [`Backfill`] fans out missed-message fetches for a batch of
//!   conversations and invalidates the unread aggregate once per batch.
//!
//! Backfill never advances cursors itself; the reconciler does that when a
//! buffered message is merged.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use courtside_proto::message::{ChatContext, ConfirmedMessage, MessageId};

use crate::chat::{ApiError, ChatApi, ChatEvent};

/// Errors that can occur while backfilling a conversation.
#[derive(Debug, thiserror::Error)]
pub enum BackfillError {
    /// The missed-messages fetch failed.
    #[error("backfill of {context} failed: {source}")]
    Fetch {
        /// Conversation that could not be fetched.
        context: ChatContext,
        /// Underlying API failure.
        #[source]
        source: ApiError,
    },
}

// ---------------------------------------------------------------------------
// Cursors
// ---------------------------------------------------------------------------

/// Last confirmed message id merged per conversation.
#[derive(Debug, Default)]
pub struct CursorStore {
    cursors: Mutex<HashMap<ChatContext, MessageId>>,
}

impl CursorStore {
    /// Create an empty cursor store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current cursor of a conversation.
    pub fn get(&self, context: &ChatContext) -> Option<MessageId> {
        self.cursors.lock().get(context).cloned()
    }

    /// Move the cursor to `id` if it is newer than the current one.
    /// Returns whether the cursor moved.
    pub fn advance(&self, context: &ChatContext, id: &MessageId) -> bool {
        let mut cursors = self.cursors.lock();
        match cursors.get(context) {
            Some(current) if current >= id => false,
            _ => {
                tracing::debug!(context = %context, cursor = %id, "cursor advanced");
                cursors.insert(context.clone(), id.clone());
                true
            }
        }
    }

    /// Forget a conversation's cursor.
    pub fn clear(&self, context: &ChatContext) {
        self.cursors.lock().remove(context);
    }
}

// ---------------------------------------------------------------------------
// Missed-message buffer
// ---------------------------------------------------------------------------

/// Fetched messages waiting to be merged, per conversation.
#[derive(Debug, Default)]
pub struct MissedBuffer {
    pending: Mutex<HashMap<ChatContext, Vec<ConfirmedMessage>>>,
}

impl MissedBuffer {
    /// Create an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append fetched messages, skipping ids already buffered. Keeps each
    /// conversation ordered by id. Returns how many were added.
    pub fn append(&self, context: &ChatContext, messages: Vec<ConfirmedMessage>) -> usize {
        let mut pending = self.pending.lock();
        let list = pending.entry(context.clone()).or_default();
        let mut known: HashSet<MessageId> = list.iter().map(|m| m.id.clone()).collect();
        let before = list.len();
        for message in messages {
            if known.insert(message.id.clone()) {
                list.push(message);
            }
        }
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list.len() - before
    }

    /// Remove and return everything buffered for a conversation.
    pub fn take(&self, context: &ChatContext) -> Vec<ConfirmedMessage> {
        self.pending.lock().remove(context).unwrap_or_default()
    }

    /// Number of buffered messages for a conversation.
    pub fn len(&self, context: &ChatContext) -> usize {
        self.pending.lock().get(context).map_or(0, Vec::len)
    }

    /// Whether nothing is buffered for a conversation.
    pub fn is_empty(&self, context: &ChatContext) -> bool {
        self.len(context) == 0
    }

    /// Newest buffered id of a conversation.
    pub fn last_id(&self, context: &ChatContext) -> Option<MessageId> {
        self.pending
            .lock()
            .get(context)
            .and_then(|list| list.last())
            .map(|m| m.id.clone())
    }
}

// ---------------------------------------------------------------------------
// Unread aggregate
// ---------------------------------------------------------------------------

/// Cached unread counters. `None` means stale and due for a refetch.
#[derive(Debug, Default)]
pub struct UnreadCache {
    counts: Mutex<Option<HashMap<ChatContext, u32>>>,
    invalidations: AtomicUsize,
}

impl UnreadCache {
    /// Create an empty (stale) cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cached counters with freshly fetched values.
    pub fn store(&self, counts: HashMap<ChatContext, u32>) {
        *self.counts.lock() = Some(counts);
    }

    /// Cached count for one conversation, if the cache is fresh.
    pub fn get(&self, context: &ChatContext) -> Option<u32> {
        self.counts
            .lock()
            .as_ref()
            .map(|counts| counts.get(context).copied().unwrap_or(0))
    }

    /// Sum over all conversations, if the cache is fresh.
    pub fn total(&self) -> Option<u32> {
        self.counts.lock().as_ref().map(|c| c.values().sum())
    }

    /// Mark the cache stale.
    pub fn invalidate(&self) {
        *self.counts.lock() = None;
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }

    /// How many times the cache has been invalidated.
    pub fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Backfill
// ---------------------------------------------------------------------------

/// Outcome of one backfill batch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BackfillSummary {
    /// Newly buffered messages per conversation (zero counts omitted).
    pub fetched: HashMap<ChatContext, usize>,
    /// Conversations whose fetch failed and should be retried on the next
    /// activation.
    pub failed: Vec<ChatContext>,
}

impl BackfillSummary {
    /// Total number of newly buffered messages.
    #[must_use]
    pub fn total(&self) -> usize {
        self.fetched.values().sum()
    }
}

/// Fetches messages missed while disconnected.
pub struct Backfill<A: ChatApi> {
    api: Arc<A>,
    cursors: Arc<CursorStore>,
    buffer: Arc<MissedBuffer>,
    unread: Arc<UnreadCache>,
    event_tx: mpsc::Sender<ChatEvent>,
}

impl<A: ChatApi> Backfill<A> {
    /// Create a backfill runner over shared cursor, buffer and unread state.
    pub const fn new(
        api: Arc<A>,
        cursors: Arc<CursorStore>,
        buffer: Arc<MissedBuffer>,
        unread: Arc<UnreadCache>,
        event_tx: mpsc::Sender<ChatEvent>,
    ) -> Self {
        Self {
            api,
            cursors,
            buffer,
            unread,
            event_tx,
        }
    }

    /// The buffer fetched messages land in.
    pub const fn buffer(&self) -> &Arc<MissedBuffer> {
        &self.buffer
    }

    /// Backfill one conversation that became active again.
    pub async fn activate(&self, context: &ChatContext) -> BackfillSummary {
        self.run(std::slice::from_ref(context)).await
    }

    /// Backfill a batch of conversations concurrently.
    ///
    /// Failures are logged and reported in the summary; they do not stop
    /// the other conversations. If anything new was buffered, the unread
    /// aggregate is invalidated once for the whole batch.
    pub async fn run(&self, contexts: &[ChatContext]) -> BackfillSummary {
        let results =
            futures_util::future::join_all(contexts.iter().map(|ctx| self.fetch_one(ctx))).await;

        let mut summary = BackfillSummary::default();
        for (context, result) in contexts.iter().zip(results) {
            match result {
                Ok(0) => {}
                Ok(count) => {
                    summary.fetched.insert(context.clone(), count);
                    let _ = self.event_tx.try_send(ChatEvent::BackfillReady {
                        context: context.clone(),
                        count: self.buffer.len(context),
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "backfill failed, will retry on next activation");
                    summary.failed.push(context.clone());
                }
            }
        }

        if summary.total() > 0 {
            self.unread.invalidate();
            let _ = self.event_tx.try_send(ChatEvent::UnreadRefreshRequested);
        }
        tracing::debug!(
            conversations = contexts.len(),
            fetched = summary.total(),
            failed = summary.failed.len(),
            "backfill batch done"
        );
        summary
    }

    /// Fetch everything newer than what this client already holds.
    async fn fetch_one(&self, context: &ChatContext) -> Result<usize, BackfillError> {
        let after = match (self.cursors.get(context), self.buffer.last_id(context)) {
            (Some(cursor), Some(buffered)) => Some(cursor.max(buffered)),
            (cursor, buffered) => cursor.or(buffered),
        };
        let messages = self
            .api
            .missed_messages(context, after.as_ref())
            .await
            .map_err(|source| BackfillError::Fetch {
                context: context.clone(),
                source,
            })?;
        Ok(self.buffer.append(context, messages))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::event_channel;
    use crate::chat::memory::InMemoryChatServer;
    use courtside_proto::message::{ContextType, MessagePayload, UserId};

    fn game() -> ChatContext {
        ChatContext::new(ContextType::Game, "g-1")
    }

    fn dm() -> ChatContext {
        ChatContext::new(ContextType::User, "dm-1")
    }

    fn message(context: ChatContext, text: &str) -> ConfirmedMessage {
        ConfirmedMessage::from_payload(context, UserId::new("bob"), &MessagePayload::text(text))
    }

    /// Chat API that fails missed-message fetches for one conversation.
    struct FailingFor {
        inner: InMemoryChatServer,
        broken: ChatContext,
        fetches: AtomicUsize,
    }

    impl ChatApi for FailingFor {
        async fn create_message(
            &self,
            context: &ChatContext,
            payload: &MessagePayload,
        ) -> Result<ConfirmedMessage, ApiError> {
            self.inner.create_message(context, payload).await
        }

        async fn missed_messages(
            &self,
            context: &ChatContext,
            after: Option<&MessageId>,
        ) -> Result<Vec<ConfirmedMessage>, ApiError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if *context == self.broken {
                return Err(ApiError::Network("connection reset".into()));
            }
            self.inner.missed_messages(context, after).await
        }
    }

    fn backfill<A: ChatApi>(
        api: Arc<A>,
    ) -> (Backfill<A>, Arc<CursorStore>, Arc<UnreadCache>, mpsc::Receiver<ChatEvent>) {
        let cursors = Arc::new(CursorStore::new());
        let unread = Arc::new(UnreadCache::new());
        let (tx, rx) = event_channel(64);
        let runner = Backfill::new(
            api,
            Arc::clone(&cursors),
            Arc::new(MissedBuffer::new()),
            Arc::clone(&unread),
            tx,
        );
        (runner, cursors, unread, rx)
    }

    #[test]
    fn cursor_never_regresses() {
        let cursors = CursorStore::new();
        let older = MessageId::new();
        let newer = MessageId::new();

        assert!(cursors.advance(&game(), &newer));
        assert!(!cursors.advance(&game(), &older));
        assert!(!cursors.advance(&game(), &newer));
        assert_eq!(cursors.get(&game()), Some(newer));
        assert!(cursors.get(&dm()).is_none());
    }

    #[test]
    fn buffer_dedupes_orders_and_consumes_once() {
        let buffer = MissedBuffer::new();
        let first = message(game(), "one");
        let second = message(game(), "two");

        assert_eq!(buffer.append(&game(), vec![second.clone(), first.clone()]), 2);
        assert_eq!(buffer.append(&game(), vec![first.clone()]), 0);
        assert_eq!(buffer.last_id(&game()), Some(second.id.clone()));

        assert_eq!(buffer.take(&game()), vec![first, second]);
        assert!(buffer.take(&game()).is_empty());
        assert!(buffer.is_empty(&game()));
    }

    #[test]
    fn unread_cache_reports_stale_after_invalidate() {
        let cache = UnreadCache::new();
        assert!(cache.total().is_none());
        cache.store(HashMap::from([(game(), 3), (dm(), 2)]));
        assert_eq!(cache.total(), Some(5));
        assert_eq!(cache.get(&dm()), Some(2));

        cache.invalidate();
        assert!(cache.get(&game()).is_none());
        assert_eq!(cache.invalidations(), 1);
    }

    #[tokio::test]
    async fn fetches_after_cursor_and_leaves_cursor_alone() {
        let server = Arc::new(InMemoryChatServer::new(UserId::new("alice")));
        let seen = message(game(), "seen");
        server.inject(seen.clone());
        server.inject(message(game(), "missed"));
        let (runner, cursors, _unread, _events) = backfill(Arc::clone(&server));
        cursors.advance(&game(), &seen.id);

        let summary = runner.activate(&game()).await;
        assert_eq!(summary.fetched.get(&game()), Some(&1));
        assert_eq!(runner.buffer().take(&game())[0].text, "missed");
        assert_eq!(cursors.get(&game()), Some(seen.id));
    }

    #[tokio::test]
    async fn repeated_activation_does_not_refetch_buffered_messages() {
        let server = Arc::new(InMemoryChatServer::new(UserId::new("alice")));
        server.inject(message(game(), "missed"));
        let (runner, _cursors, unread, _events) = backfill(Arc::clone(&server));

        assert_eq!(runner.activate(&game()).await.total(), 1);
        assert_eq!(runner.activate(&game()).await.total(), 0);
        assert_eq!(runner.buffer().len(&game()), 1);
        assert_eq!(unread.invalidations(), 1);
    }

    #[tokio::test]
    async fn batch_invalidates_unread_once() {
        let server = Arc::new(InMemoryChatServer::new(UserId::new("alice")));
        server.inject(message(game(), "g"));
        server.inject(message(dm(), "d"));
        let (runner, _cursors, unread, mut events) = backfill(Arc::clone(&server));

        let summary = runner.run(&[game(), dm()]).await;
        assert_eq!(summary.total(), 2);
        assert_eq!(unread.invalidations(), 1);

        let mut refreshes = 0;
        let mut ready = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                ChatEvent::UnreadRefreshRequested => refreshes += 1,
                ChatEvent::BackfillReady { .. } => ready += 1,
                _ => {}
            }
        }
        assert_eq!(refreshes, 1);
        assert_eq!(ready, 2);
    }

    #[tokio::test]
    async fn empty_batch_does_not_touch_unread() {
        let server = Arc::new(InMemoryChatServer::new(UserId::new("alice")));
        let (runner, _cursors, unread, mut events) = backfill(server);

        runner.run(&[game(), dm()]).await;
        assert_eq!(unread.invalidations(), 0);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn one_failure_does_not_block_the_batch() {
        let inner = InMemoryChatServer::new(UserId::new("alice"));
        inner.inject(message(game(), "ok"));
        let api = Arc::new(FailingFor {
            inner,
            broken: dm(),
            fetches: AtomicUsize::new(0),
        });
        let (runner, _cursors, unread, _events) = backfill(Arc::clone(&api));

        let summary = runner.run(&[game(), dm()]).await;
        assert_eq!(summary.failed, vec![dm()]);
        assert_eq!(summary.fetched.get(&game()), Some(&1));
        assert_eq!(api.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(unread.invalidations(), 1);
    }
}
