//! Room-scoped fan-out
//!
//! Every room owns one broadcast topic. Each joined connection gets a
//! forwarder task that drains the topic into the connection's bounded
//! outbound queue, so publishing never waits on a socket and one slow
//! member cannot hold up the others.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::AbortHandle;

use crate::core::connection::Connection;

#[derive(Debug, Clone)]
pub struct RoomTopic {
    sender: broadcast::Sender<Arc<str>>,
}

impl RoomTopic {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish a serialized event; returns the number of subscribed connections
    pub fn publish(&self, payload: &str) -> usize {
        // No receivers just means nobody is listening right now
        self.sender.send(Arc::from(payload)).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<str>> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Forward room events to one connection until either side goes away
pub fn spawn_forwarder(
    room_id: String,
    mut receiver: broadcast::Receiver<Arc<str>>,
    connection: Connection,
) -> AbortHandle {
    let handle = tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(payload) => {
                    if connection.is_closed() {
                        break;
                    }
                    connection.send_text(&payload);
                }
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!(
                        "Connection {} lagging in room {}, skipped {} events",
                        connection.id,
                        room_id,
                        skipped
                    );
                }
                Err(RecvError::Closed) => break,
            }
        }
        log::trace!("Forwarder for connection {} in room {} stopped", connection.id, room_id);
    });
    handle.abort_handle()
}
