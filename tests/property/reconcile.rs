// Test-specific lint overrides for property tests.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::missing_docs_in_private_items)]

//! Property tests for matching confirmed messages to outbox entries.
//!
//! Uses proptest to verify:
//! 1. Mention order never affects a match.
//! 2. Different text never matches.
//! 3. Whatever order confirmed copies arrive in, every outbox entry is
//!    cleared exactly once and each message renders once.
//! 4. Identical messages are each matched by one confirmed copy.

use std::sync::Arc;

use courtside::chat::event_channel;
use courtside::chat::reconcile::{ConversationView, Reconciler, ViewItem, matches_confirmed};
use courtside::outbox::{OutboxStatus, OutboxStore, QueuedMessage};
use courtside::storage::MemoryKv;
use courtside::sync::CursorStore;
use courtside_proto::message::{
    ChatContext, ConfirmedMessage, ContextType, MessagePayload, TempId, Timestamp, UserId,
};
use proptest::prelude::*;

fn me() -> UserId {
    UserId::new("alice")
}

fn game() -> ChatContext {
    ChatContext::new(ContextType::Game, "g-prop")
}

fn entry(payload: MessagePayload) -> QueuedMessage {
    QueuedMessage {
        temp_id: TempId::new(),
        context: game(),
        payload,
        created_at: Timestamp::now(),
        status: OutboxStatus::Sending,
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// Appends `texts` to an outbox, delivers their confirmed copies in the
/// order given by `order`, and returns (matched, remaining entries,
/// rendered item count).
fn deliver(texts: &[String], order: &[usize]) -> (usize, usize, usize) {
    runtime().block_on(async {
        let outbox = Arc::new(OutboxStore::new(MemoryKv::new()));
        let (tx, _rx) = event_channel(1024);
        let reconciler = Reconciler::new(Arc::clone(&outbox), Arc::new(CursorStore::new()), me(), tx);

        let mut confirmed = Vec::new();
        for text in texts {
            let payload = MessagePayload::text(text.clone());
            outbox.append(&game(), payload.clone()).await.unwrap();
            confirmed.push(ConfirmedMessage::from_payload(game(), me(), &payload));
        }

        let mut view = ConversationView::new(game());
        let mut matched = 0;
        for &i in order {
            let report = reconciler.ingest(&mut view, vec![confirmed[i].clone()]).await;
            matched += report.matched.len();
        }
        let items = view.items();
        assert!(items.iter().all(|item| matches!(item, ViewItem::Confirmed(_))));
        (matched, outbox.list(&game()).await.len(), items.len())
    })
}

fn arb_texts_and_order() -> impl Strategy<Value = (Vec<String>, Vec<usize>)> {
    prop::collection::vec("[a-z]{1,12}", 1..8).prop_flat_map(|texts| {
        let order: Vec<usize> = (0..texts.len()).collect();
        (Just(texts), Just(order).prop_shuffle())
    })
}

proptest! {
    #[test]
    fn mention_order_is_irrelevant(
        text in "[a-z]{1,10}",
        mentions in prop::collection::vec("[a-z]{1,6}".prop_map(UserId::new), 0..6)
            .prop_shuffle(),
    ) {
        let queued = entry(MessagePayload::text(text.clone()).with_mentions(mentions.clone()));
        let mut reversed = mentions;
        reversed.reverse();
        let confirmed = ConfirmedMessage::from_payload(
            game(),
            me(),
            &MessagePayload::text(text).with_mentions(reversed),
        );
        prop_assert!(matches_confirmed(&queued, &confirmed, &me()));
    }

    #[test]
    fn different_text_never_matches(a in "[a-z]{1,10}", b in "[a-z]{1,10}") {
        prop_assume!(a != b);
        let queued = entry(MessagePayload::text(a));
        let confirmed = ConfirmedMessage::from_payload(game(), me(), &MessagePayload::text(b));
        prop_assert!(!matches_confirmed(&queued, &confirmed, &me()));
    }

    #[test]
    fn other_senders_never_match(text in "[a-z]{1,10}") {
        let payload = MessagePayload::text(text);
        let queued = entry(payload.clone());
        let confirmed = ConfirmedMessage::from_payload(game(), UserId::new("bob"), &payload);
        prop_assert!(!matches_confirmed(&queued, &confirmed, &me()));
    }

    #[test]
    fn any_arrival_order_clears_each_entry_once((texts, order) in arb_texts_and_order()) {
        let (matched, remaining, rendered) = deliver(&texts, &order);
        prop_assert_eq!(matched, texts.len());
        prop_assert_eq!(remaining, 0);
        prop_assert_eq!(rendered, texts.len());
    }

    #[test]
    fn identical_messages_each_claim_one_entry(copies in 1usize..6) {
        let texts = vec!["gg".to_string(); copies];
        let order: Vec<usize> = (0..copies).rev().collect();
        let (matched, remaining, rendered) = deliver(&texts, &order);
        prop_assert_eq!(matched, copies);
        prop_assert_eq!(remaining, 0);
        prop_assert_eq!(rendered, copies);
    }
}
