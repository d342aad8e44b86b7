//! Rusty Jukebox - shared listening rooms over WebSocket
//!
//! Participants join a room around a host, submit media links to a shared
//! queue and vote on them, while the host advances playback. Queue and vote
//! changes flow through a durable, ordered pipeline so several server
//! processes can share one store.

pub mod auth;
pub mod config;
pub mod constants;
pub mod core;
pub mod error;
pub mod handlers;
pub mod pipeline;
pub mod storage;

// Re-export main components
pub use config::*;
pub use constants::*;
pub use error::{JukeboxError, Result};
