//! Courtside client library: offline-tolerant chat delivery and presence.

pub mod chat;
pub mod config;
pub mod outbox;
pub mod presence;
pub mod storage;
pub mod sync;
