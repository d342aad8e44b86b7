//! Core room coordination

pub mod connection;
pub mod coordinator;
pub mod fanout;
pub mod media;
pub mod message_handler;
pub mod message_types;
pub mod queue_selector;
pub mod rate_limiter;
pub mod room;
pub mod session;

// Re-export main components for convenience
pub use connection::Connection;
pub use coordinator::Coordinator;
pub use message_handler::MessageHandler;
pub use message_types::{ClientMessage, ServerEvent, VoteDirection};
pub use rate_limiter::RateLimiter;
pub use room::{Room, RoomManager};
pub use session::SessionRegistry;
