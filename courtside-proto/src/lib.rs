//! Shared protocol definitions for Courtside chat delivery and presence.

pub mod codec;
pub mod message;
pub mod presence;
