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

//! Integration tests for sending while offline.
//!
//! Drives a [`ChatSession`] against the in-process chat server:
//! - a message composed offline is rendered immediately
//! - the send deadline marks it failed without losing it
//! - a manual retry succeeds once the network is back
//! - the confirmed copy on the stream replaces the placeholder, leaving
//!   exactly one rendered message
//! - the queue survives a restart through file-backed storage

use std::sync::Arc;
use std::time::Duration;

use courtside::chat::memory::InMemoryChatServer;
use courtside::chat::reconcile::{ConversationView, PlaceholderStatus, ViewItem};
use courtside::chat::session::ChatSession;
use courtside::chat::{ChatEvent, SendError};
use courtside::config::ClientConfig;
use courtside::outbox::OutboxStatus;
use courtside::storage::MemoryKv;
use courtside_proto::message::{ChatContext, ContextType, MessagePayload, UserId};

fn game() -> ChatContext {
    ChatContext::new(ContextType::Game, "match-42")
}

fn alice() -> UserId {
    UserId::new("alice")
}

fn rendered_texts(view: &ConversationView) -> Vec<String> {
    view.items()
        .into_iter()
        .map(|item| match item {
            ViewItem::Confirmed(m) => m.text.clone(),
            ViewItem::Pending(p) => p.payload.text_or_empty().to_string(),
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn offline_send_fails_then_retry_leaves_one_message() {
    let server = Arc::new(InMemoryChatServer::new(alice()));
    let mut stream = server.subscribe_stream();
    let (session, mut events) = ChatSession::new(
        Arc::clone(&server),
        MemoryKv::new(),
        alice(),
        Duration::from_secs(10),
        64,
    );
    let mut view = ConversationView::new(game());

    server.set_reachable(false);
    let (temp_id, attempt) = session
        .compose(&mut view, MessagePayload::text("hi"))
        .await
        .unwrap();
    assert_eq!(rendered_texts(&view), vec!["hi"]);

    // Twelve seconds without a network.
    tokio::time::sleep(Duration::from_secs(12)).await;
    assert!(attempt.is_finished());
    assert!(matches!(attempt.await.unwrap(), Err(SendError::Timeout(_))));

    session.refresh(&mut view).await;
    assert_eq!(view.placeholders()[0].status, PlaceholderStatus::Failed);
    assert_eq!(
        session.outbox().get(&game(), temp_id).await.unwrap().status,
        OutboxStatus::Failed
    );
    assert!(matches!(
        events.recv().await.unwrap(),
        ChatEvent::SendFailed { temp_id: t, .. } if t == temp_id
    ));

    server.set_reachable(true);
    session.retry(&mut view, temp_id).await.unwrap();
    // Accepted but not yet confirmed: still exactly one pending copy.
    assert_eq!(rendered_texts(&view), vec!["hi"]);
    assert!(matches!(view.items()[0], ViewItem::Pending(_)));

    let confirmed = stream.recv().await.unwrap();
    let report = session.on_stream(&mut view, vec![confirmed.clone()]).await;
    assert_eq!(report.matched, vec![temp_id]);
    assert!(report.fresh.is_empty());

    assert_eq!(rendered_texts(&view), vec!["hi"]);
    assert!(matches!(view.items()[0], ViewItem::Confirmed(_)));
    assert!(session.outbox().list(&game()).await.is_empty());
    assert_eq!(server.messages(&game()).len(), 1);

    // The same confirmed message again (e.g. via backfill) changes nothing.
    let report = session.on_stream(&mut view, vec![confirmed]).await;
    assert!(report.matched.is_empty() && report.fresh.is_empty());
    assert_eq!(rendered_texts(&view), vec!["hi"]);

    assert!(matches!(events.recv().await.unwrap(), ChatEvent::SendAccepted { .. }));
    assert!(matches!(
        events.recv().await.unwrap(),
        ChatEvent::OutboxReconciled { matched, .. } if matched == vec![temp_id]
    ));
}

#[tokio::test(start_paused = true)]
async fn late_confirmation_clears_failed_entry() {
    let server = Arc::new(InMemoryChatServer::new(alice()));
    let mut stream = server.subscribe_stream();
    let (session, _events) = ChatSession::new(
        Arc::clone(&server),
        MemoryKv::new(),
        alice(),
        Duration::from_secs(10),
        64,
    );
    let mut view = ConversationView::new(game());

    // The server is slower than the deadline but does create the message.
    server.set_latency(Duration::from_secs(15));
    let (temp_id, attempt) = session
        .compose(&mut view, MessagePayload::text("slow"))
        .await
        .unwrap();
    assert!(matches!(attempt.await.unwrap(), Err(SendError::Timeout(_))));
    assert_eq!(
        session.outbox().get(&game(), temp_id).await.unwrap().status,
        OutboxStatus::Failed
    );

    let confirmed = stream.recv().await.unwrap();
    let report = session.on_stream(&mut view, vec![confirmed]).await;
    assert_eq!(report.matched, vec![temp_id]);
    assert_eq!(rendered_texts(&view), vec!["slow"]);
    assert!(session.outbox().list(&game()).await.is_empty());
}

#[tokio::test]
async fn failed_entry_survives_restart() {
    let dir = std::env::temp_dir().join(format!("courtside-restart-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    let config = ClientConfig {
        storage_dir: dir.clone(),
        ..ClientConfig::default()
    };

    let server = Arc::new(InMemoryChatServer::new(alice()));
    server.set_reject(Some("slow mode".into()));
    let temp_id = {
        let (session, _events) = ChatSession::from_config(Arc::clone(&server), alice(), &config);
        let mut view = ConversationView::new(game());
        let (temp_id, attempt) = session
            .compose(&mut view, MessagePayload::text("persist me"))
            .await
            .unwrap();
        assert!(attempt.await.unwrap().is_err());
        temp_id
    };

    // A fresh session over the same directory sees the failed entry.
    let (session, _events) = ChatSession::from_config(Arc::clone(&server), alice(), &config);
    let mut view = ConversationView::new(game());
    session.open(&mut view).await;
    assert_eq!(view.placeholders().len(), 1);
    assert_eq!(view.placeholders()[0].temp_id, temp_id);
    assert_eq!(view.placeholders()[0].status, PlaceholderStatus::Failed);

    server.set_reject(None);
    session.retry(&mut view, temp_id).await.unwrap();
    assert_eq!(server.messages(&game())[0].text, "persist me");

    let _ = std::fs::remove_dir_all(&dir);
}
