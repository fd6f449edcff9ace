//! Merging the outbox with the authoritative message stream.
//!
//! The client does not know a message's server id while it is pending, so
//! a confirmed message is matched to an outbox entry by content: sender,
//! text, normalized subtype, reply target and the mention set (order does
//! not matter). Two identical messages sent back to back are therefore
//! indistinguishable; each confirmed copy claims the oldest unclaimed entry.
//!
//! [`ConversationView`] is the merged list the UI renders: confirmed
//! messages in server order, followed by one placeholder per remaining
//! outbox entry.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;

use courtside_proto::message::{
    ChatContext, ChatSubtype, ConfirmedMessage, MessageId, MessagePayload, TempId, Timestamp,
    UserId,
};

use crate::outbox::{OutboxStatus, OutboxStore, QueuedMessage};
use crate::storage::KvStore;
use crate::sync::{CursorStore, MissedBuffer};

use super::ChatEvent;

/// Whether `confirmed` is the server's copy of the outbox entry `entry`.
#[must_use]
pub fn matches_confirmed(entry: &QueuedMessage, confirmed: &ConfirmedMessage, self_id: &UserId) -> bool {
    confirmed.sender_id.as_ref() == Some(self_id)
        && confirmed.context == entry.context
        && confirmed.text == entry.payload.text_or_empty()
        && confirmed.subtype == entry.payload.normalized_subtype()
        && confirmed.reply_to == entry.payload.reply_to
        && confirmed.mention_set() == entry.payload.mention_set()
}

/// Display state of a pending message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStatus {
    /// Queued or being sent.
    Sending,
    /// Last attempt failed; a retry is possible.
    Failed,
}

impl From<OutboxStatus> for PlaceholderStatus {
    fn from(status: OutboxStatus) -> Self {
        match status {
            OutboxStatus::Queued | OutboxStatus::Sending => Self::Sending,
            OutboxStatus::Failed => Self::Failed,
        }
    }
}

/// An outbox entry rendered optimistically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    /// Outbox correlation id.
    pub temp_id: TempId,
    /// What the user sent.
    pub payload: MessagePayload,
    /// When the user pressed send.
    pub created_at: Timestamp,
    /// Display state.
    pub status: PlaceholderStatus,
}

/// One visible item of a [`ConversationView`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewItem<'a> {
    /// A server-confirmed message.
    Confirmed(&'a ConfirmedMessage),
    /// A message still in the outbox.
    Pending(&'a Placeholder),
}

/// The merged message list of one conversation.
#[derive(Debug, Clone)]
pub struct ConversationView {
    context: ChatContext,
    /// Chat tab this view shows; `None` shows every subtype.
    subtype: Option<ChatSubtype>,
    confirmed: Vec<ConfirmedMessage>,
    seen: HashSet<MessageId>,
    placeholders: Vec<Placeholder>,
}

impl ConversationView {
    /// An empty view over every subtype of `context`.
    #[must_use]
    pub fn new(context: ChatContext) -> Self {
        Self {
            context,
            subtype: None,
            confirmed: Vec::new(),
            seen: HashSet::new(),
            placeholders: Vec::new(),
        }
    }

    /// An empty view showing only one chat tab.
    #[must_use]
    pub fn for_subtype(context: ChatContext, subtype: ChatSubtype) -> Self {
        Self {
            subtype: Some(subtype),
            ..Self::new(context)
        }
    }

    /// Conversation this view belongs to.
    #[must_use]
    pub const fn context(&self) -> &ChatContext {
        &self.context
    }

    /// Confirmed messages in server order, regardless of the tab filter.
    #[must_use]
    pub fn confirmed(&self) -> &[ConfirmedMessage] {
        &self.confirmed
    }

    /// Placeholders in outbox order, regardless of the tab filter.
    #[must_use]
    pub fn placeholders(&self) -> &[Placeholder] {
        &self.placeholders
    }

    /// Whether a confirmed id has already been merged.
    #[must_use]
    pub fn contains(&self, id: &MessageId) -> bool {
        self.seen.contains(id)
    }

    /// The visible items: confirmed messages, then placeholders.
    #[must_use]
    pub fn items(&self) -> Vec<ViewItem<'_>> {
        let confirmed = self
            .confirmed
            .iter()
            .filter(|m| self.subtype.is_none_or(|s| m.subtype == s))
            .map(ViewItem::Confirmed);
        let pending = self
            .placeholders
            .iter()
            .filter(|p| self.subtype.is_none_or(|s| p.payload.normalized_subtype() == s))
            .map(ViewItem::Pending);
        confirmed.chain(pending).collect()
    }

    fn insert_confirmed(&mut self, messages: Vec<ConfirmedMessage>) {
        for message in messages {
            if self.seen.insert(message.id.clone()) {
                self.confirmed.push(message);
            }
        }
        self.confirmed.sort_by(|a, b| a.id.cmp(&b.id));
    }

    fn set_placeholders(&mut self, entries: Vec<QueuedMessage>) {
        let mut ids = HashSet::with_capacity(entries.len());
        self.placeholders = entries
            .into_iter()
            .filter(|e| ids.insert(e.temp_id))
            .map(|e| Placeholder {
                temp_id: e.temp_id,
                payload: e.payload,
                created_at: e.created_at,
                status: e.status.into(),
            })
            .collect();
    }
}

/// What one [`Reconciler::ingest`] call changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Outbox entries replaced by their confirmed copies.
    pub matched: Vec<TempId>,
    /// Newly merged ids that did not replace an outbox entry.
    pub fresh: Vec<MessageId>,
}

/// Applies confirmed messages to conversation views and the outbox.
pub struct Reconciler<K: KvStore> {
    outbox: Arc<OutboxStore<K>>,
    cursors: Arc<CursorStore>,
    self_id: UserId,
    event_tx: mpsc::Sender<ChatEvent>,
}

impl<K: KvStore> Reconciler<K> {
    /// Create a reconciler for the user `self_id`.
    pub const fn new(
        outbox: Arc<OutboxStore<K>>,
        cursors: Arc<CursorStore>,
        self_id: UserId,
        event_tx: mpsc::Sender<ChatEvent>,
    ) -> Self {
        Self {
            outbox,
            cursors,
            self_id,
            event_tx,
        }
    }

    /// Merge confirmed messages into `view`.
    ///
    /// Messages of other conversations and ids already merged are ignored.
    /// Each remaining message authored by this user removes the first
    /// unclaimed matching outbox entry, whatever its status, so a success
    /// that arrives after the send deadline still clears the failed entry.
    /// The cursor advances to the newest merged id.
    pub async fn ingest(
        &self,
        view: &mut ConversationView,
        incoming: Vec<ConfirmedMessage>,
    ) -> ReconcileReport {
        let context = view.context.clone();
        let mut batch_ids = HashSet::new();
        let incoming: Vec<ConfirmedMessage> = incoming
            .into_iter()
            .filter(|m| m.context == context && !view.contains(&m.id) && batch_ids.insert(m.id.clone()))
            .collect();

        let mut report = ReconcileReport::default();
        if incoming.is_empty() {
            self.refresh_placeholders(view).await;
            return report;
        }

        let pending = self.outbox.list(&context).await;
        let mut claimed = HashSet::new();
        for message in &incoming {
            let entry = pending.iter().find(|e| {
                !claimed.contains(&e.temp_id) && matches_confirmed(e, message, &self.self_id)
            });
            match entry {
                Some(entry) => {
                    claimed.insert(entry.temp_id);
                    report.matched.push(entry.temp_id);
                }
                None => report.fresh.push(message.id.clone()),
            }
        }

        if !report.matched.is_empty() {
            self.outbox.remove_many(&context, &report.matched).await;
            tracing::debug!(context = %context, matched = report.matched.len(), "outbox reconciled");
        }

        if let Some(newest) = incoming.iter().map(|m| &m.id).max() {
            self.cursors.advance(&context, newest);
        }
        view.insert_confirmed(incoming);
        self.refresh_placeholders(view).await;

        if !report.matched.is_empty() {
            let _ = self.event_tx.try_send(ChatEvent::OutboxReconciled {
                context,
                matched: report.matched.clone(),
            });
        }
        report
    }

    /// Merge everything the backfill buffered for this view's conversation.
    pub async fn drain_backfill(
        &self,
        view: &mut ConversationView,
        buffer: &MissedBuffer,
    ) -> ReconcileReport {
        let batch = buffer.take(&view.context);
        self.ingest(view, batch).await
    }

    /// Rebuild the view's placeholders from the current outbox contents.
    pub async fn refresh_placeholders(&self, view: &mut ConversationView) {
        let entries = self.outbox.list(&view.context).await;
        view.set_placeholders(entries);
    }
}
