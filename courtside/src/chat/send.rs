//! Deadline-bounded delivery of outbox entries.
//!
//! [`SendCoordinator`] drives one entry at a time through
//! `queued -> sending -> (failed | awaiting reconciliation)`:
//!
//! 1. Claim the `tempId` in the in-flight set (single-flight).
//! 2. Mark the entry `sending` in the outbox.
//! 3. Race the create call against the send deadline.
//! 4. On success leave the entry alone: the reconciler removes it once the
//!    confirmed copy shows up on the stream.
//! 5. On timeout or rejection mark it `failed` and emit
//!    [`ChatEvent::SendFailed`].
//!
//! A timed-out call is not aborted. It keeps running in the background and
//! a late success reconciles like any other confirmed message.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use courtside_proto::message::{ChatContext, ConfirmedMessage, MessageId, TempId};

use crate::outbox::{OutboxStatus, OutboxStore};
use crate::storage::KvStore;

use super::{ApiError, ChatApi, ChatEvent, SendError};

/// Default send deadline.
pub const DEFAULT_SEND_DEADLINE: Duration = Duration::from_secs(10);

/// Reason recorded for entries left `sending` by a previous process.
const INTERRUPTED: &str = "send interrupted before completion";

/// Bookkeeping for one in-flight attempt.
struct InFlight {
    context: ChatContext,
    /// Distinguishes attempts so a stale attempt never clears a newer one.
    attempt: u64,
    cancel: oneshot::Sender<()>,
}

/// How the race between the create call and the deadline ended.
enum Race {
    Finished(Result<Result<ConfirmedMessage, ApiError>, tokio::task::JoinError>),
    Deadline,
    Cancelled,
}

/// Sends outbox entries with a deadline and single-flight guarantee.
pub struct SendCoordinator<A: ChatApi, K: KvStore + 'static> {
    api: Arc<A>,
    outbox: Arc<OutboxStore<K>>,
    deadline: Duration,
    in_flight: Mutex<HashMap<TempId, InFlight>>,
    next_attempt: AtomicU64,
    event_tx: mpsc::Sender<ChatEvent>,
}

impl<A: ChatApi, K: KvStore + 'static> SendCoordinator<A, K> {
    /// Create a coordinator that reports outcomes on `event_tx`.
    pub fn new(
        api: Arc<A>,
        outbox: Arc<OutboxStore<K>>,
        deadline: Duration,
        event_tx: mpsc::Sender<ChatEvent>,
    ) -> Self {
        Self {
            api,
            outbox,
            deadline,
            in_flight: Mutex::new(HashMap::new()),
            next_attempt: AtomicU64::new(0),
            event_tx,
        }
    }

    /// The outbox this coordinator sends from.
    pub const fn outbox(&self) -> &Arc<OutboxStore<K>> {
        &self.outbox
    }

    /// The configured send deadline.
    pub const fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Run one send attempt for an outbox entry and wait for its outcome.
    ///
    /// # Errors
    ///
    /// - [`SendError::UnknownEntry`] if the entry is not in the outbox
    /// - [`SendError::AlreadyInFlight`] if an attempt is already running
    /// - [`SendError::Timeout`] / [`SendError::Rejected`] when the attempt
    ///   failed; the entry has been marked `failed`
    /// - [`SendError::Cancelled`] if the entry was discarded meanwhile
    pub async fn send(&self, context: &ChatContext, temp_id: TempId) -> Result<MessageId, SendError> {
        let (attempt, mut cancel_rx) = self.claim(context, temp_id)?;

        if !self
            .outbox
            .update_status(context, temp_id, OutboxStatus::Sending)
            .await
        {
            self.finish(temp_id, attempt);
            return Err(SendError::UnknownEntry(temp_id));
        }
        let Some(entry) = self.outbox.get(context, temp_id).await else {
            self.finish(temp_id, attempt);
            return Err(SendError::UnknownEntry(temp_id));
        };
        // Discarded while the status was being written: never reach the server.
        if !matches!(cancel_rx.try_recv(), Err(oneshot::error::TryRecvError::Empty)) {
            self.finish(temp_id, attempt);
            return Err(SendError::Cancelled(temp_id));
        }
        tracing::debug!(context = %context, temp_id = %temp_id, attempt, "send dispatched");

        let api = Arc::clone(&self.api);
        let call_context = context.clone();
        let payload = entry.payload;
        let mut call =
            tokio::spawn(async move { api.create_message(&call_context, &payload).await });

        let race = tokio::select! {
            joined = &mut call => Race::Finished(joined),
            () = tokio::time::sleep(self.deadline) => Race::Deadline,
            _ = cancel_rx => Race::Cancelled,
        };

        match race {
            Race::Finished(Ok(Ok(message))) => {
                if self.finish(temp_id, attempt) {
                    tracing::debug!(
                        context = %context,
                        temp_id = %temp_id,
                        message_id = %message.id,
                        "send accepted, awaiting reconciliation"
                    );
                    let _ = self.event_tx.try_send(ChatEvent::SendAccepted {
                        context: context.clone(),
                        temp_id,
                        message_id: message.id.clone(),
                    });
                }
                Ok(message.id)
            }
            Race::Finished(Ok(Err(e))) => {
                let error = SendError::Rejected(e);
                self.fail(context, temp_id, attempt, &error).await;
                Err(error)
            }
            Race::Finished(Err(join)) => {
                let error = SendError::Rejected(ApiError::Network(join.to_string()));
                self.fail(context, temp_id, attempt, &error).await;
                Err(error)
            }
            Race::Deadline => {
                detach_late_call(call, context, temp_id);
                let error = SendError::Timeout(self.deadline);
                self.fail(context, temp_id, attempt, &error).await;
                Err(error)
            }
            Race::Cancelled => {
                detach_late_call(call, context, temp_id);
                Err(SendError::Cancelled(temp_id))
            }
        }
    }

    /// Start a send attempt in the background.
    pub fn dispatch(
        self: &Arc<Self>,
        context: &ChatContext,
        temp_id: TempId,
    ) -> JoinHandle<Result<MessageId, SendError>> {
        let this = Arc::clone(self);
        let context = context.clone();
        tokio::spawn(async move { this.send(&context, temp_id).await })
    }

    /// Manually retry a `failed` entry: re-queue it and run a new attempt.
    ///
    /// An entry the server already accepted stays `sending` until its
    /// confirmed copy is reconciled and is not retried.
    ///
    /// # Errors
    ///
    /// - [`SendError::NotFailed`] if the entry is `queued` or `sending`
    /// - otherwise the same as [`send`](Self::send)
    pub async fn retry(&self, context: &ChatContext, temp_id: TempId) -> Result<MessageId, SendError> {
        if self.is_sending(temp_id) {
            return Err(SendError::AlreadyInFlight(temp_id));
        }
        let entry = self
            .outbox
            .get(context, temp_id)
            .await
            .ok_or(SendError::UnknownEntry(temp_id))?;
        if entry.status != OutboxStatus::Failed {
            return Err(SendError::NotFailed(temp_id));
        }
        if !self
            .outbox
            .update_status(context, temp_id, OutboxStatus::Queued)
            .await
        {
            return Err(SendError::UnknownEntry(temp_id));
        }
        tracing::debug!(context = %context, temp_id = %temp_id, "manual retry");
        self.send(context, temp_id).await
    }

    /// Drop an entry the user gave up on. Any running attempt stops being
    /// watched and will not report a failure. Returns whether the entry was
    /// in the outbox.
    pub async fn discard(&self, context: &ChatContext, temp_id: TempId) -> bool {
        self.cancel(temp_id);
        self.outbox.remove(context, temp_id).await
    }

    /// Stop watching the in-flight attempt for `temp_id`, if any. The
    /// network call itself is not interrupted.
    pub fn cancel(&self, temp_id: TempId) -> bool {
        let Some(flight) = self.in_flight.lock().remove(&temp_id) else {
            return false;
        };
        let _ = flight.cancel.send(());
        true
    }

    /// Stop watching every in-flight attempt of a conversation. Returns how
    /// many attempts were cancelled.
    pub fn cancel_all_for_context(&self, context: &ChatContext) -> usize {
        let cancelled: Vec<InFlight> = {
            let mut in_flight = self.in_flight.lock();
            let ids: Vec<TempId> = in_flight
                .iter()
                .filter(|(_, flight)| flight.context == *context)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| in_flight.remove(id)).collect()
        };
        let count = cancelled.len();
        for flight in cancelled {
            let _ = flight.cancel.send(());
        }
        if count > 0 {
            tracing::debug!(context = %context, count, "cancelled in-flight sends");
        }
        count
    }

    /// Whether an attempt for `temp_id` is currently in flight.
    pub fn is_sending(&self, temp_id: TempId) -> bool {
        self.in_flight.lock().contains_key(&temp_id)
    }

    /// Pick up a conversation's outbox after a restart.
    ///
    /// Entries persisted as `sending` that no attempt in this process owns
    /// become `failed`; `queued` entries are dispatched. Returns the handles
    /// of the dispatched attempts.
    pub async fn resume(
        self: &Arc<Self>,
        context: &ChatContext,
    ) -> Vec<JoinHandle<Result<MessageId, SendError>>> {
        let mut handles = Vec::new();
        for entry in self.outbox.list(context).await {
            match entry.status {
                OutboxStatus::Sending if !self.is_sending(entry.temp_id) => {
                    if self
                        .outbox
                        .update_status(context, entry.temp_id, OutboxStatus::Failed)
                        .await
                    {
                        tracing::warn!(
                            context = %context,
                            temp_id = %entry.temp_id,
                            "stale sending entry marked failed"
                        );
                        let _ = self.event_tx.try_send(ChatEvent::SendFailed {
                            context: context.clone(),
                            temp_id: entry.temp_id,
                            reason: INTERRUPTED.to_string(),
                        });
                    }
                }
                OutboxStatus::Queued => handles.push(self.dispatch(context, entry.temp_id)),
                OutboxStatus::Sending | OutboxStatus::Failed => {}
            }
        }
        handles
    }

    fn claim(
        &self,
        context: &ChatContext,
        temp_id: TempId,
    ) -> Result<(u64, oneshot::Receiver<()>), SendError> {
        let mut in_flight = self.in_flight.lock();
        if in_flight.contains_key(&temp_id) {
            return Err(SendError::AlreadyInFlight(temp_id));
        }
        let attempt = self.next_attempt.fetch_add(1, Ordering::Relaxed);
        let (cancel, cancel_rx) = oneshot::channel();
        in_flight.insert(
            temp_id,
            InFlight {
                context: context.clone(),
                attempt,
                cancel,
            },
        );
        Ok((attempt, cancel_rx))
    }

    /// Release the in-flight slot if `attempt` still owns it.
    fn finish(&self, temp_id: TempId, attempt: u64) -> bool {
        let mut in_flight = self.in_flight.lock();
        if in_flight.get(&temp_id).is_some_and(|f| f.attempt == attempt) {
            in_flight.remove(&temp_id);
            true
        } else {
            false
        }
    }

    async fn fail(&self, context: &ChatContext, temp_id: TempId, attempt: u64, error: &SendError) {
        if !self.finish(temp_id, attempt) {
            return;
        }
        // The entry may already have been reconciled by a confirmed copy.
        if !self
            .outbox
            .update_status(context, temp_id, OutboxStatus::Failed)
            .await
        {
            return;
        }
        tracing::warn!(context = %context, temp_id = %temp_id, error = %error, "send failed");
        let _ = self.event_tx.try_send(ChatEvent::SendFailed {
            context: context.clone(),
            temp_id,
            reason: error.to_string(),
        });
    }
}

/// Let an abandoned create call run to completion and log its outcome.
fn detach_late_call(
    call: JoinHandle<Result<ConfirmedMessage, ApiError>>,
    context: &ChatContext,
    temp_id: TempId,
) {
    let context = context.clone();
    tokio::spawn(async move {
        match call.await {
            Ok(Ok(message)) => tracing::debug!(
                context = %context,
                temp_id = %temp_id,
                message_id = %message.id,
                "late create succeeded"
            ),
            Ok(Err(e)) => tracing::debug!(
                context = %context,
                temp_id = %temp_id,
                error = %e,
                "late create failed"
            ),
            Err(_) => {}
        }
    });
}
