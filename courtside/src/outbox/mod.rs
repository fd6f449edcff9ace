//! Durable per-conversation queue of messages the server has not confirmed.
//!
//! Each conversation's queue is stored as one JSON array under the key
//! `chat-outbox:<TYPE>:<id>`, in append order. Reads go through an
//! in-memory cache that is dropped on every mutation.
//!
//! # Storage failures
//!
//! If the [`KvStore`] cannot be read or written, the affected conversation
//! falls back to an in-memory queue:
//! 1. The error is logged (the send flow never sees it).
//! 2. The mutated queue is kept in memory and served to readers.
//! 3. The next mutation that reaches storage writes the full queue back
//!    and leaves degraded mode.
//!
//! A queue built after a failed *read* only holds what changed since. Once
//! storage is readable again the stored entries are merged back in by
//! `tempId` before anything is written, so entries persisted before the
//! outage are never overwritten.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use courtside_proto::message::{ChatContext, MessagePayload, TempId, Timestamp, ValidationError};

use crate::storage::{KvStore, StorageError};

/// Delivery state of an outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    /// Waiting for a send attempt.
    Queued,
    /// A send attempt is (or was, before a restart) in progress.
    Sending,
    /// The last attempt timed out or was rejected; awaiting manual retry.
    Failed,
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Sending => write!(f, "sending"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A message waiting for server confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMessage {
    /// Client correlation id.
    pub temp_id: TempId,
    /// Conversation the message was composed in.
    pub context: ChatContext,
    /// What the user sent.
    pub payload: MessagePayload,
    /// When the user pressed send.
    pub created_at: Timestamp,
    /// Delivery state.
    pub status: OutboxStatus,
}

/// Storage key for a conversation's queue.
#[must_use]
pub fn storage_key(context: &ChatContext) -> String {
    format!("chat-outbox:{context}")
}

/// A queue held in memory while storage is failing.
#[derive(Debug, Clone)]
struct DegradedQueue {
    queue: Vec<QueuedMessage>,
    /// Storage could not be read, so `queue` lacks the stored entries.
    unmerged: bool,
}

impl DegradedQueue {
    /// Stored entries first, updated by in-memory copies, then entries
    /// appended during the outage.
    fn merge_into(self, stored: Vec<QueuedMessage>) -> Vec<QueuedMessage> {
        let mut pending: HashMap<TempId, QueuedMessage> =
            self.queue.iter().map(|m| (m.temp_id, m.clone())).collect();
        let mut merged: Vec<QueuedMessage> = stored
            .into_iter()
            .map(|m| pending.remove(&m.temp_id).unwrap_or(m))
            .collect();
        merged.extend(
            self.queue
                .into_iter()
                .filter(|m| pending.contains_key(&m.temp_id)),
        );
        merged
    }
}

/// The local outbox.
pub struct OutboxStore<K: KvStore> {
    /// Durable backing store.
    kv: K,
    /// Read cache per conversation, dropped on every mutation.
    cache: Mutex<HashMap<ChatContext, Vec<QueuedMessage>>>,
    /// Queues that could not be persisted and live only in memory.
    degraded: Mutex<HashMap<ChatContext, DegradedQueue>>,
    /// Serializes read-modify-write cycles.
    write_lock: tokio::sync::Mutex<()>,
}

impl<K: KvStore> OutboxStore<K> {
    /// Create an outbox over the given storage.
    #[must_use]
    pub fn new(kv: K) -> Self {
        Self {
            kv,
            cache: Mutex::new(HashMap::new()),
            degraded: Mutex::new(HashMap::new()),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Access the backing store.
    pub const fn kv(&self) -> &K {
        &self.kv
    }

    /// Append a new `queued` entry for `payload` and return its correlation id.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if the payload is empty or too large.
    /// Storage failures are not errors (see the module docs).
    pub async fn append(
        &self,
        context: &ChatContext,
        payload: MessagePayload,
    ) -> Result<TempId, ValidationError> {
        payload.validate()?;
        let entry = QueuedMessage {
            temp_id: TempId::new(),
            context: context.clone(),
            payload,
            created_at: Timestamp::now(),
            status: OutboxStatus::Queued,
        };
        let temp_id = entry.temp_id;
        self.mutate(context, move |queue| {
            queue.push(entry);
            true
        })
        .await;
        tracing::debug!(context = %context, temp_id = %temp_id, "outbox append");
        Ok(temp_id)
    }

    /// All entries of a conversation, in append order.
    pub async fn list(&self, context: &ChatContext) -> Vec<QueuedMessage> {
        self.load(context).await.0
    }

    /// A single entry, if present.
    pub async fn get(&self, context: &ChatContext, temp_id: TempId) -> Option<QueuedMessage> {
        self.list(context)
            .await
            .into_iter()
            .find(|m| m.temp_id == temp_id)
    }

    /// Set the status of an entry. Returns `false` if the entry is gone.
    pub async fn update_status(
        &self,
        context: &ChatContext,
        temp_id: TempId,
        status: OutboxStatus,
    ) -> bool {
        self.mutate(context, |queue| {
            queue
                .iter_mut()
                .find(|m| m.temp_id == temp_id)
                .is_some_and(|m| {
                    let changed = m.status != status;
                    m.status = status;
                    changed
                })
        })
        .await
            || self.get(context, temp_id).await.is_some()
    }

    /// Record uploaded attachment URLs on an entry before it is sent.
    /// Returns `false` if the entry is gone.
    pub async fn attach_media(
        &self,
        context: &ChatContext,
        temp_id: TempId,
        media_urls: Vec<String>,
        thumbnail_urls: Vec<String>,
    ) -> bool {
        self.mutate(context, move |queue| {
            queue
                .iter_mut()
                .find(|m| m.temp_id == temp_id)
                .is_some_and(|m| {
                    m.payload.media_urls = media_urls;
                    m.payload.thumbnail_urls = thumbnail_urls;
                    true
                })
        })
        .await
    }

    /// Remove an entry. Removing a missing entry is a no-op; returns whether
    /// something was removed.
    pub async fn remove(&self, context: &ChatContext, temp_id: TempId) -> bool {
        self.remove_many(context, &[temp_id]).await > 0
    }

    /// Remove several entries with a single storage write. Returns how many
    /// were removed.
    pub async fn remove_many(&self, context: &ChatContext, temp_ids: &[TempId]) -> usize {
        if temp_ids.is_empty() {
            return 0;
        }
        let doomed: HashSet<TempId> = temp_ids.iter().copied().collect();
        let mut removed = 0;
        self.mutate(context, |queue| {
            let before = queue.len();
            queue.retain(|m| !doomed.contains(&m.temp_id));
            removed = before - queue.len();
            removed > 0
        })
        .await;
        if removed > 0 {
            tracing::debug!(context = %context, removed, "outbox remove");
        }
        removed
    }

    /// Whether this conversation's queue currently lives only in memory.
    pub fn is_degraded(&self, context: &ChatContext) -> bool {
        self.degraded.lock().contains_key(context)
    }

    /// Load a queue. The flag is `false` when storage could not be read and
    /// the result must not be written back over what storage holds.
    async fn load(&self, context: &ChatContext) -> (Vec<QueuedMessage>, bool) {
        let degraded = self.degraded.lock().get(context).cloned();
        if let Some(degraded) = degraded {
            if !degraded.unmerged {
                return (degraded.queue, true);
            }
            return match self.read_stored(context).await {
                Ok(stored) => {
                    tracing::debug!(context = %context, "storage readable again, merging outbox");
                    (degraded.merge_into(stored), true)
                }
                Err(_) => (degraded.queue, false),
            };
        }
        if let Some(queue) = self.cache.lock().get(context) {
            return (queue.clone(), true);
        }

        match self.read_stored(context).await {
            Ok(queue) => {
                self.cache.lock().insert(context.clone(), queue.clone());
                (queue, true)
            }
            Err(_) => (Vec::new(), false),
        }
    }

    /// Read a queue straight from storage. A corrupt value reads as empty.
    async fn read_stored(&self, context: &ChatContext) -> Result<Vec<QueuedMessage>, StorageError> {
        let bytes = match self.kv.get(&storage_key(context)).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(Vec::new()),
            Err(e) => {
                tracing::warn!(
                    context = %context,
                    error = %e,
                    "outbox read failed, using in-memory queue"
                );
                return Err(e);
            }
        };
        Ok(serde_json::from_slice::<Vec<QueuedMessage>>(&bytes).unwrap_or_else(|e| {
            tracing::warn!(
                context = %context,
                error = %e,
                "outbox entry is corrupt, starting from an empty queue"
            );
            Vec::new()
        }))
    }

    /// Read-modify-write one conversation's queue. `apply` returns whether
    /// it changed anything; unchanged queues are not written.
    async fn mutate<F>(&self, context: &ChatContext, apply: F) -> bool
    where
        F: FnOnce(&mut Vec<QueuedMessage>) -> bool,
    {
        let _guard = self.write_lock.lock().await;
        let (mut queue, readable) = self.load(context).await;
        if !apply(&mut queue) {
            return false;
        }

        self.cache.lock().remove(context);
        if readable && self.persist(context, &queue).await {
            self.degraded.lock().remove(context);
            return true;
        }

        // Unreadable storage leaves the queue partial until the next merge.
        self.degraded.lock().insert(
            context.clone(),
            DegradedQueue {
                queue,
                unmerged: !readable,
            },
        );
        true
    }

    async fn persist(&self, context: &ChatContext, queue: &[QueuedMessage]) -> bool {
        let key = storage_key(context);
        let result = if queue.is_empty() {
            self.kv.delete(&key).await
        } else {
            match serde_json::to_vec(queue) {
                Ok(bytes) => self.kv.set(&key, bytes).await,
                Err(e) => {
                    tracing::warn!(context = %context, error = %e, "outbox encode failed");
                    return false;
                }
            }
        };
        if let Err(e) = result {
            tracing::warn!(
                context = %context,
                error = %e,
                "outbox write failed, keeping queue in memory"
            );
            return false;
        }
        true
    }
}
