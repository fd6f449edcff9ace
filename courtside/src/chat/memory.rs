//! In-process chat server for testing and demos.
//!
//! [`InMemoryChatServer`] implements [`ChatApi`] over a map of confirmed
//! messages and pushes every created or injected message onto a broadcast
//! stream, which plays the part of the authoritative message stream. The
//! network can be switched off with [`set_reachable`](InMemoryChatServer::set_reachable):
//! while unreachable, missed-message fetches fail and create calls hang.
//! A create call started offline never reaches the server; it fails with a
//! network error once the network comes back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};

use courtside_proto::message::{ChatContext, ConfirmedMessage, MessageId, MessagePayload, UserId};

use super::{ApiError, ChatApi};

/// Capacity of the confirmed-message broadcast stream.
const STREAM_CAPACITY: usize = 256;

/// In-process stand-in for the remote chat API.
pub struct InMemoryChatServer {
    /// Author recorded on messages created through [`ChatApi::create_message`].
    sender_id: UserId,
    /// Confirmed messages per conversation, ascending by id.
    messages: Mutex<HashMap<ChatContext, Vec<ConfirmedMessage>>>,
    /// Authoritative stream of confirmed messages.
    stream: broadcast::Sender<ConfirmedMessage>,
    /// Simulated network state.
    reachable: watch::Sender<bool>,
    /// Simulated server processing time for create calls.
    latency: Mutex<Duration>,
    /// When set, create calls are rejected with this reason.
    reject: Mutex<Option<String>>,
    /// Number of create calls received.
    create_calls: AtomicUsize,
}

impl InMemoryChatServer {
    /// Create a reachable server that records `sender_id` as the author of
    /// created messages.
    pub fn new(sender_id: UserId) -> Self {
        let (stream, _) = broadcast::channel(STREAM_CAPACITY);
        let (reachable, _) = watch::channel(true);
        Self {
            sender_id,
            messages: Mutex::new(HashMap::new()),
            stream,
            reachable,
            latency: Mutex::new(Duration::ZERO),
            reject: Mutex::new(None),
            create_calls: AtomicUsize::new(0),
        }
    }

    /// Subscribe to the confirmed-message stream.
    pub fn subscribe_stream(&self) -> broadcast::Receiver<ConfirmedMessage> {
        self.stream.subscribe()
    }

    /// Switch the simulated network on or off.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.send_replace(reachable);
    }

    /// Set how long create calls take once the network is reachable.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Reject subsequent create calls with `reason`, or accept them again
    /// with `None`.
    pub fn set_reject(&self, reason: Option<String>) {
        *self.reject.lock() = reason;
    }

    /// Store a message from another participant and push it to the stream.
    pub fn inject(&self, message: ConfirmedMessage) {
        self.store(message.clone());
        let _ = self.stream.send(message);
    }

    /// All confirmed messages of a conversation, ascending by id.
    pub fn messages(&self, context: &ChatContext) -> Vec<ConfirmedMessage> {
        self.messages
            .lock()
            .get(context)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of create calls received so far.
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    fn store(&self, message: ConfirmedMessage) {
        let mut messages = self.messages.lock();
        let list = messages.entry(message.context.clone()).or_default();
        if list.iter().any(|m| m.id == message.id) {
            return;
        }
        list.push(message);
        list.sort_by(|a, b| a.id.cmp(&b.id));
    }
}

impl ChatApi for InMemoryChatServer {
    async fn create_message(
        &self,
        context: &ChatContext,
        payload: &MessagePayload,
    ) -> Result<ConfirmedMessage, ApiError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);

        let mut reachable = self.reachable.subscribe();
        if !*reachable.borrow_and_update() {
            reachable
                .wait_for(|up| *up)
                .await
                .map_err(|e| ApiError::Network(e.to_string()))?;
            return Err(ApiError::Network(
                "connection lost before the request arrived".to_string(),
            ));
        }

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let reject = self.reject.lock().clone();
        if let Some(reason) = reject {
            return Err(ApiError::Rejected(reason));
        }

        let message = ConfirmedMessage::from_payload(context.clone(), self.sender_id.clone(), payload);
        self.store(message.clone());
        let _ = self.stream.send(message.clone());
        Ok(message)
    }

    async fn missed_messages(
        &self,
        context: &ChatContext,
        after: Option<&MessageId>,
    ) -> Result<Vec<ConfirmedMessage>, ApiError> {
        if !*self.reachable.borrow() {
            return Err(ApiError::Network("server unreachable".into()));
        }
        Ok(self
            .messages(context)
            .into_iter()
            .filter(|m| after.is_none_or(|cursor| m.id > *cursor))
            .collect())
    }
}
