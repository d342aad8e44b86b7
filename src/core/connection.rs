//! WebSocket connection handle
//! Outbound frames go through a bounded per-connection queue

use std::time::{Duration, Instant};

use log::warn;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;
use warp::ws::Message;

pub type ConnectionId = String;

/// Cheap, cloneable handle to one live transport connection
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub sender: mpsc::Sender<Message>,
    pub connected_at: Instant,
}

impl Connection {
    /// Create a new connection with a unique ID
    pub fn new(sender: mpsc::Sender<Message>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), sender)
    }

    pub fn with_id(id: ConnectionId, sender: mpsc::Sender<Message>) -> Self {
        Self {
            id,
            sender,
            connected_at: Instant::now(),
        }
    }

    /// Queue a text frame without waiting. A full queue drops the frame for
    /// this connection only.
    pub fn send_text(&self, text: &str) -> bool {
        match self.sender.try_send(Message::text(text)) {
            Ok(_) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Outbound queue full for connection {}, dropping frame", self.id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("Connection {} already closed", self.id);
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Calculate the connection duration
    pub fn connection_duration(&self) -> Duration {
        self.connected_at.elapsed()
    }
}
