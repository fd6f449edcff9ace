//! Coalesced presence subscriptions.
//!
//! Each UI surface registers a named list of user ids it wants live
//! presence for. The registry merges all lists into one subscription:
//!
//! - high-priority ids (explicit lists on screen) are always included
//! - low-priority ids (ambient glances) fill the remaining budget, up to
//!   `low_priority_cap` of them and only while the total is below
//!   `total_cap`
//!
//! Changes are debounced: a burst of `want` / `release` calls produces a
//! single subscribe call with the final merged set.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use courtside_proto::message::UserId;

use super::{ConnectionEvent, PresenceBoard, PresenceError, PresenceTransport};

/// How strongly a surface needs its ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    /// Explicit list, always subscribed.
    High,
    /// Ambient demand, subscribed while budget remains.
    Low,
}

/// Tuning for the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterestConfig {
    /// Quiet period before a merged subscription is sent.
    pub debounce: Duration,
    /// Maximum number of low-priority ids in the merged set.
    pub low_priority_cap: usize,
    /// Total size the merged set may reach through low-priority ids.
    pub total_cap: usize,
}

impl Default for InterestConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(400),
            low_priority_cap: 1000,
            total_cap: 3000,
        }
    }
}

/// Which kind of connect happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectKind {
    /// First session of this client.
    Initial,
    /// A later session; edges may have been missed while down.
    Reconnect,
}

/// A named demand list.
#[derive(Debug, Clone)]
struct Wanted {
    name: String,
    priority: Priority,
    ids: Vec<UserId>,
}

/// Merge demand lists into one subscription.
///
/// Lists are visited in the given order; duplicates are dropped. High
/// priority ids come first, then low priority ids, each group sorted, so a
/// server that truncates an oversized subscription drops low priority ids
/// first.
pub fn merge_interest<'a, I>(lists: I, config: &InterestConfig) -> Vec<UserId>
where
    I: IntoIterator<Item = (Priority, &'a [UserId])> + Clone,
{
    let mut seen: HashSet<&UserId> = HashSet::new();
    let mut merged: Vec<UserId> = Vec::new();

    for (_, ids) in lists.clone().into_iter().filter(|(p, _)| *p == Priority::High) {
        for id in ids {
            if seen.insert(id) {
                merged.push(id.clone());
            }
        }
    }

    merged.sort();
    let high = merged.len();

    let mut low = 0;
    'low: for (_, ids) in lists.into_iter().filter(|(p, _)| *p == Priority::Low) {
        for id in ids {
            if low >= config.low_priority_cap || merged.len() >= config.total_cap {
                break 'low;
            }
            if seen.insert(id) {
                merged.push(id.clone());
                low += 1;
            }
        }
    }

    merged[high..].sort();
    merged
}

#[derive(Default)]
struct RegistryState {
    lists: Vec<Wanted>,
    /// Debounce timer of the next flush.
    pending: Option<JoinHandle<()>>,
    /// Last subscription the transport accepted.
    last_sent: Option<Vec<UserId>>,
}

/// Merges UI demand into one debounced presence subscription.
pub struct InterestRegistry<T: PresenceTransport> {
    transport: Arc<T>,
    board: Arc<PresenceBoard>,
    config: InterestConfig,
    state: Mutex<RegistryState>,
}

impl<T: PresenceTransport> InterestRegistry<T> {
    /// Create a registry that subscribes through `transport` and writes
    /// snapshot answers to `board`.
    pub fn new(transport: Arc<T>, board: Arc<PresenceBoard>, config: InterestConfig) -> Self {
        Self {
            transport,
            board,
            config,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// The board snapshot answers are written to.
    pub const fn board(&self) -> &Arc<PresenceBoard> {
        &self.board
    }

    /// Register or replace the list called `name`.
    pub fn want(self: &Arc<Self>, name: &str, priority: Priority, ids: Vec<UserId>) {
        {
            let mut state = self.state.lock();
            let wanted = Wanted {
                name: name.to_string(),
                priority,
                ids,
            };
            match state.lists.iter_mut().find(|w| w.name == name) {
                Some(existing) => *existing = wanted,
                None => state.lists.push(wanted),
            }
        }
        self.schedule_flush();
    }

    /// Drop the list called `name`. Unknown names are ignored.
    pub fn release(self: &Arc<Self>, name: &str) {
        let removed = {
            let mut state = self.state.lock();
            let before = state.lists.len();
            state.lists.retain(|w| w.name != name);
            state.lists.len() != before
        };
        if removed {
            self.schedule_flush();
        }
    }

    /// The merged subscription for the current demand.
    pub fn merged(&self) -> Vec<UserId> {
        let state = self.state.lock();
        merge_interest(
            state.lists.iter().map(|w| (w.priority, w.ids.as_slice())),
            &self.config,
        )
    }

    /// Send the merged subscription now if it differs from the last one
    /// sent. Returns whether a subscribe call was made.
    ///
    /// # Errors
    ///
    /// Returns [`PresenceError`] if the subscribe call failed; the next
    /// flush or connect will try again.
    pub async fn flush(&self) -> Result<bool, PresenceError> {
        let merged = self.merged();
        if self.state.lock().last_sent.as_ref() == Some(&merged) {
            return Ok(false);
        }
        self.send(merged).await?;
        Ok(true)
    }

    /// React to a new transport session: resubscribe immediately, and on a
    /// reconnect fetch a snapshot to repair missed edges. Failures are
    /// logged and the board keeps its last known state.
    pub async fn on_connected(&self, kind: ConnectKind) {
        let merged = self.merged();
        if let Err(e) = self.send(merged.clone()).await {
            tracing::warn!(error = %e, "presence resubscribe failed");
        }
        if kind == ConnectKind::Reconnect && !merged.is_empty() {
            match self.transport.snapshot(merged).await {
                Ok(statuses) => {
                    let changed = self.board.apply_snapshot(statuses);
                    tracing::debug!(changed = changed.len(), "presence snapshot applied");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "presence snapshot failed, keeping last known state");
                }
            }
        }
    }

    /// Feed one connection event through the registry and board. Returns
    /// the users whose known state changed.
    pub async fn handle_event(&self, event: &ConnectionEvent) -> Vec<(UserId, bool)> {
        match event {
            ConnectionEvent::Connected { reconnect } => {
                let kind = if *reconnect {
                    ConnectKind::Reconnect
                } else {
                    ConnectKind::Initial
                };
                let before = self.board.online();
                self.on_connected(kind).await;
                let after = self.board.online();
                before
                    .iter()
                    .filter(|id| !after.contains(id))
                    .map(|id| (id.clone(), false))
                    .chain(
                        after
                            .iter()
                            .filter(|id| !before.contains(id))
                            .map(|id| (id.clone(), true)),
                    )
                    .collect()
            }
            ConnectionEvent::Disconnected => {
                self.state.lock().last_sent = None;
                Vec::new()
            }
            ConnectionEvent::Presence(event) => self.board.apply(event),
        }
    }

    async fn send(&self, merged: Vec<UserId>) -> Result<(), PresenceError> {
        let count = merged.len();
        self.transport.subscribe(merged.clone()).await?;
        self.state.lock().last_sent = Some(merged);
        tracing::debug!(count, "presence subscription sent");
        Ok(())
    }

    fn schedule_flush(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let debounce = self.config.debounce;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if let Err(e) = this.flush().await {
                tracing::warn!(error = %e, "presence subscribe failed");
            }
        });
        if let Some(previous) = self.state.lock().pending.replace(timer) {
            previous.abort();
        }
    }
}
