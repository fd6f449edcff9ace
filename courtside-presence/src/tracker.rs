//! Authoritative presence tracking.
//!
//! [`PresenceTracker`] keeps the last activity instant of every recently
//! active user. A user is online while `now - last_activity < ttl`.
//! Activity from a user who is not online emits a [`PresenceChange::Online`]
//! immediately; a periodic sweep evicts expired users and emits
//! [`PresenceChange::Offline`] once per eviction.
//!
//! The tracker has an explicit lifecycle: [`PresenceTracker::init`] installs
//! the notifier and starts the sweep, [`PresenceTracker::stop`] cancels the
//! sweep, drops the notifier and clears all state.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use courtside_proto::message::UserId;

/// Default activity window after which a user is offline.
pub const DEFAULT_TTL: Duration = Duration::from_secs(120);

/// Errors from the tracker lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    /// [`PresenceTracker::init`] was called on a running tracker.
    #[error("presence tracker is already running")]
    AlreadyRunning,

    /// The tracker was used before [`PresenceTracker::init`] or after
    /// [`PresenceTracker::stop`].
    #[error("presence tracker is not running")]
    NotRunning,
}

/// An edge-triggered presence transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceChange {
    /// The user transitioned offline -> online.
    Online(UserId),
    /// The user transitioned online -> offline.
    Offline(UserId),
}

impl PresenceChange {
    /// The user the change is about.
    #[must_use]
    pub const fn user_id(&self) -> &UserId {
        match self {
            Self::Online(id) | Self::Offline(id) => id,
        }
    }
}

/// Timing parameters for the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerConfig {
    /// Activity window.
    pub ttl: Duration,
    /// Interval between expiry sweeps.
    pub sweep_interval: Duration,
}

impl TrackerConfig {
    /// Config with the given TTL and a sweep interval of a quarter of it.
    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            sweep_interval: ttl / 4,
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }
}

#[derive(Default)]
struct TrackerState {
    last_activity: HashMap<UserId, Instant>,
    notifier: Option<mpsc::UnboundedSender<PresenceChange>>,
    sweeper: Option<JoinHandle<()>>,
}

impl TrackerState {
    fn notify(&self, change: PresenceChange) {
        if let Some(tx) = &self.notifier {
            let _ = tx.send(change);
        }
    }
}

/// Server-side presence map with TTL expiry.
pub struct PresenceTracker {
    config: TrackerConfig,
    state: Mutex<TrackerState>,
}

impl PresenceTracker {
    /// Create a stopped tracker.
    #[must_use]
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Timing parameters in use.
    #[must_use]
    pub const fn config(&self) -> TrackerConfig {
        self.config
    }

    /// Install `notifier` and start the periodic sweep.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::AlreadyRunning`] if the tracker was already
    /// initialized and not stopped since.
    pub fn init(
        self: &Arc<Self>,
        notifier: mpsc::UnboundedSender<PresenceChange>,
    ) -> Result<(), TrackerError> {
        let mut state = self.state.lock();
        if state.notifier.is_some() {
            return Err(TrackerError::AlreadyRunning);
        }
        state.notifier = Some(notifier);

        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval;
        state.sweeper = Some(tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticks.tick().await;
                let Some(tracker) = weak.upgrade() else {
                    break;
                };
                tracker.sweep();
            }
        }));

        tracing::info!(
            ttl_secs = self.config.ttl.as_secs(),
            sweep_secs = self.config.sweep_interval.as_secs(),
            "presence tracker started"
        );
        Ok(())
    }

    /// Cancel the sweep, drop the notifier and forget every user.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if let Some(sweeper) = state.sweeper.take() {
            sweeper.abort();
        }
        state.notifier = None;
        state.last_activity.clear();
        tracing::info!("presence tracker stopped");
    }

    /// Whether [`init`](Self::init) has run and [`stop`](Self::stop) has not.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.lock().notifier.is_some()
    }

    /// Record activity for `user_id`. Returns `true` if the user just came
    /// online.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::NotRunning`] outside the init/stop lifecycle.
    pub fn record_activity(&self, user_id: &UserId) -> Result<bool, TrackerError> {
        let now = Instant::now();
        let mut state = self.state.lock();
        if state.notifier.is_none() {
            return Err(TrackerError::NotRunning);
        }
        let was_online = state
            .last_activity
            .insert(user_id.clone(), now)
            .is_some_and(|last| now.duration_since(last) < self.config.ttl);
        if !was_online {
            tracing::debug!(user_id = %user_id, "user online");
            state.notify(PresenceChange::Online(user_id.clone()));
        }
        Ok(!was_online)
    }

    /// Explicit logout: forget `user_id` and emit offline if it was tracked.
    pub fn logout(&self, user_id: &UserId) -> bool {
        let mut state = self.state.lock();
        let removed = state.last_activity.remove(user_id).is_some();
        if removed {
            tracing::debug!(user_id = %user_id, "user logged out");
            state.notify(PresenceChange::Offline(user_id.clone()));
        }
        removed
    }

    /// Whether `user_id` is online now.
    #[must_use]
    pub fn is_online(&self, user_id: &UserId) -> bool {
        let now = Instant::now();
        self.state
            .lock()
            .last_activity
            .get(user_id)
            .is_some_and(|last| now.duration_since(*last) < self.config.ttl)
    }

    /// Online state of each of `ids`, in request order.
    #[must_use]
    pub fn snapshot(&self, ids: &[UserId]) -> Vec<(UserId, bool)> {
        let now = Instant::now();
        let state = self.state.lock();
        ids.iter()
            .map(|id| {
                let online = state
                    .last_activity
                    .get(id)
                    .is_some_and(|last| now.duration_since(*last) < self.config.ttl);
                (id.clone(), online)
            })
            .collect()
    }

    /// Number of tracked users, expired-but-unswept included.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.state.lock().last_activity.len()
    }

    /// Evict every expired user and emit offline for each. Runs on every
    /// sweep tick; returns the evicted users.
    pub fn sweep(&self) -> Vec<UserId> {
        let now = Instant::now();
        let ttl = self.config.ttl;
        let mut state = self.state.lock();

        let mut expired = Vec::new();
        state.last_activity.retain(|id, last| {
            let keep = now.duration_since(*last) < ttl;
            if !keep {
                expired.push(id.clone());
            }
            keep
        });
        expired.sort();

        if expired.is_empty() {
            tracing::debug!(tracked = state.last_activity.len(), "sweep evicted nothing");
        } else {
            tracing::debug!(count = expired.len(), "sweep evicted expired users");
        }
        for id in &expired {
            state.notify(PresenceChange::Offline(id.clone()));
        }
        expired
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        if let Some(sweeper) = self.state.get_mut().sweeper.take() {
            sweeper.abort();
        }
    }
}
