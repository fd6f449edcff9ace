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

//! Integration tests for client presence against a real presence server.
//!
//! Starts `courtside-presence` in-process on an OS-assigned port and drives
//! it with [`PresenceConnection`] + [`InterestRegistry`]:
//! - subscribed users coming online and logging out reach the board
//! - after the server drops every connection, the client reconnects,
//!   resubscribes and repairs the board from a snapshot

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use courtside::config::ReconnectConfig;
use courtside::presence::connection::{ConnectionConfig, PresenceConnection};
use courtside::presence::interest::{InterestConfig, InterestRegistry, Priority};
use courtside::presence::{ConnectionEvent, PresenceBoard, PresenceTransport};
use courtside_presence::server::{PresenceState, start_server_with_state};
use courtside_proto::message::UserId;
use tokio::sync::mpsc;

/// Maximum time to wait for an expected presence change.
const WAIT: Duration = Duration::from_secs(5);

fn fast_config() -> ConnectionConfig {
    ConnectionConfig {
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(1),
            max_attempts: Some(10),
        },
        ..ConnectionConfig::default()
    }
}

fn fast_interest() -> InterestConfig {
    InterestConfig {
        debounce: Duration::from_millis(20),
        ..InterestConfig::default()
    }
}

async fn start_server() -> (SocketAddr, Arc<PresenceState>) {
    let state = Arc::new(PresenceState::new());
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();
    (addr, state)
}

fn url(addr: SocketAddr) -> String {
    format!("ws://{addr}/presence")
}

/// Feed connection events into the registry until `id` has state `online`.
/// Returns every event seen on the way.
async fn wait_for(
    registry: &InterestRegistry<PresenceConnection>,
    events: &mut mpsc::Receiver<ConnectionEvent>,
    id: &UserId,
    online: bool,
) -> Vec<ConnectionEvent> {
    let mut seen = Vec::new();
    tokio::time::timeout(WAIT, async {
        while registry.board().is_online(id) != Some(online) {
            let event = events.recv().await.expect("connection event channel closed");
            registry.handle_event(&event).await;
            seen.push(event);
        }
    })
    .await
    .expect("timed out waiting for presence change");
    seen
}

/// Connect `user` and wait until its session is up.
async fn connect(addr: SocketAddr, user: &str) -> (PresenceConnection, mpsc::Receiver<ConnectionEvent>) {
    let (connection, mut events) =
        PresenceConnection::start(&url(addr), UserId::new(user), fast_config()).unwrap();
    let first = tokio::time::timeout(WAIT, events.recv()).await.unwrap();
    assert_eq!(first, Some(ConnectionEvent::Connected { reconnect: false }));
    (connection, events)
}

#[tokio::test]
async fn subscribed_user_online_then_logout() {
    let (addr, _state) = start_server().await;
    let (alice, mut alice_events) = connect(addr, "alice").await;
    let registry = Arc::new(InterestRegistry::new(
        Arc::new(alice),
        Arc::new(PresenceBoard::new()),
        fast_interest(),
    ));
    registry.want("roster", Priority::High, vec![UserId::new("bob")]);
    // Let the debounced subscribe go out.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (bob, _bob_events) = connect(addr, "bob").await;
    wait_for(&registry, &mut alice_events, &UserId::new("bob"), true).await;

    bob.logout().unwrap();
    wait_for(&registry, &mut alice_events, &UserId::new("bob"), false).await;
    bob.shutdown().await;
}

#[tokio::test]
async fn snapshot_reports_current_state() {
    let (addr, _state) = start_server().await;
    let (alice, _events) = connect(addr, "alice").await;
    let (_bob, _bob_events) = connect(addr, "bob").await;

    let statuses = alice
        .snapshot(vec![UserId::new("bob"), UserId::new("carol")])
        .await
        .unwrap();
    assert_eq!(statuses.get(&UserId::new("bob")), Some(&true));
    assert_eq!(statuses.get(&UserId::new("carol")), Some(&false));
    alice.shutdown().await;
}

#[tokio::test]
async fn reconnect_resubscribes_and_repairs_board() {
    let (addr, state) = start_server().await;
    let (alice, mut alice_events) = connect(addr, "alice").await;
    let registry = Arc::new(InterestRegistry::new(
        Arc::new(alice),
        Arc::new(PresenceBoard::new()),
        fast_interest(),
    ));
    registry.want("roster", Priority::High, vec![UserId::new("dave")]);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Drop every connection, then bring dave online while alice is away.
    state.close_all_connections().await;
    let (_dave, _dave_events) = connect(addr, "dave").await;

    let seen = wait_for(&registry, &mut alice_events, &UserId::new("dave"), true).await;
    assert!(seen.contains(&ConnectionEvent::Disconnected));
    assert!(seen.contains(&ConnectionEvent::Connected { reconnect: true }));
}
