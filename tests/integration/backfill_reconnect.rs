// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::missing_docs_in_private_items
)]

//! Integration tests for catching up after a reconnect.
//!
//! These tests validate:
//! - missed messages of several conversations are fetched after the cursor
//! - a failed fetch is reported and retried on the next activation
//! - the unread aggregate is invalidated once per batch
//! - an own message whose stream push was missed reconciles via backfill

use std::sync::Arc;
use std::time::Duration;

use courtside::chat::ChatEvent;
use courtside::chat::memory::InMemoryChatServer;
use courtside::chat::reconcile::{ConversationView, ViewItem};
use courtside::chat::session::ChatSession;
use courtside::storage::MemoryKv;
use courtside_proto::message::{ChatContext, ConfirmedMessage, ContextType, MessagePayload, UserId};

fn game() -> ChatContext {
    ChatContext::new(ContextType::Game, "match-7")
}

fn dm() -> ChatContext {
    ChatContext::new(ContextType::User, "bob")
}

fn from_bob(context: ChatContext, text: &str) -> ConfirmedMessage {
    ConfirmedMessage::from_payload(context, UserId::new("bob"), &MessagePayload::text(text))
}

fn drain(events: &mut tokio::sync::mpsc::Receiver<ChatEvent>) -> Vec<ChatEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test]
async fn reconnect_fetches_after_cursor_and_invalidates_unread_once() {
    let server = Arc::new(InMemoryChatServer::new(UserId::new("alice")));
    let (session, mut events) = ChatSession::new(
        Arc::clone(&server),
        MemoryKv::new(),
        UserId::new("alice"),
        Duration::from_secs(10),
        64,
    );
    let mut view = ConversationView::new(game());

    // Seen live before the connection dropped.
    let early = from_bob(game(), "gl hf");
    server.inject(early.clone());
    session.on_stream(&mut view, vec![early.clone()]).await;
    assert_eq!(session.cursors().get(&game()), Some(early.id.clone()));

    // Missed while disconnected.
    for text in ["one", "two", "three"] {
        server.inject(from_bob(game(), text));
    }
    server.inject(from_bob(dm(), "you there?"));

    // First attempt while the network is still down.
    server.set_reachable(false);
    let summary = session.reconnect(&[game(), dm()]).await;
    assert_eq!(summary.total(), 0);
    assert_eq!(summary.failed.len(), 2);
    assert_eq!(session.unread().invalidations(), 0);
    assert!(drain(&mut events).is_empty());

    server.set_reachable(true);
    let summary = session.reconnect(&[game(), dm()]).await;
    assert_eq!(summary.fetched.get(&game()), Some(&3));
    assert_eq!(summary.fetched.get(&dm()), Some(&1));
    assert!(summary.failed.is_empty());
    assert_eq!(session.unread().invalidations(), 1);

    let events = drain(&mut events);
    let ready = events
        .iter()
        .filter(|e| matches!(e, ChatEvent::BackfillReady { .. }))
        .count();
    let refreshes = events
        .iter()
        .filter(|e| matches!(e, ChatEvent::UnreadRefreshRequested))
        .count();
    assert_eq!((ready, refreshes), (2, 1));

    let report = session.merge_backfill(&mut view).await;
    assert_eq!(report.fresh.len(), 3);
    let texts: Vec<&str> = view
        .items()
        .into_iter()
        .filter_map(|item| match item {
            ViewItem::Confirmed(m) => Some(m.text.as_str()),
            ViewItem::Pending(_) => None,
        })
        .collect();
    assert_eq!(texts, vec!["gl hf", "one", "two", "three"]);

    // Nothing new: no fetch results and no further invalidation.
    let summary = session.reconnect(&[game()]).await;
    assert_eq!(summary.total(), 0);
    assert_eq!(session.unread().invalidations(), 1);
}

#[tokio::test]
async fn own_message_missed_on_stream_reconciles_through_backfill() {
    let server = Arc::new(InMemoryChatServer::new(UserId::new("alice")));
    let (session, _events) = ChatSession::new(
        Arc::clone(&server),
        MemoryKv::new(),
        UserId::new("alice"),
        Duration::from_secs(10),
        64,
    );
    let mut view = ConversationView::new(game());

    let (temp_id, attempt) = session
        .compose(&mut view, MessagePayload::text("brb"))
        .await
        .unwrap();
    attempt.await.unwrap().unwrap();
    // The stream push is lost; the entry is still pending.
    assert_eq!(session.outbox().list(&game()).await.len(), 1);

    session.reconnect(&[game()]).await;
    let report = session.merge_backfill(&mut view).await;
    assert_eq!(report.matched, vec![temp_id]);
    assert!(report.fresh.is_empty());
    assert!(session.outbox().list(&game()).await.is_empty());
    assert!(matches!(view.items()[..], [ViewItem::Confirmed(_)]));
}
