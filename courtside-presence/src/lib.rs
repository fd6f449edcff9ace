//! Courtside presence server library.
//!
//! Exposes the authoritative [`tracker::PresenceTracker`] and the WebSocket
//! server that hosts it, for use in tests and embedding.

pub mod config;
pub mod server;
pub mod tracker;
