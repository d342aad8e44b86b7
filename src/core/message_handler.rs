//! Inbound message routing

use log::{debug, info, trace, warn};
use std::sync::Arc;

use crate::constants::MAX_INBOUND_MESSAGE_SIZE;
use crate::core::connection::Connection;
use crate::core::coordinator::Coordinator;
use crate::core::message_types::ClientMessage;
use crate::error::{JukeboxError, Result};

/// Decodes client envelopes and routes them to the coordinator
pub struct MessageHandler {
    coordinator: Arc<Coordinator>,
}

impl MessageHandler {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    /// Handle one text frame. Failures become an error event for the caller
    /// and never close the connection.
    pub async fn handle_text(&self, connection: &Connection, text: &str) {
        if let Err(e) = self.dispatch(connection, text).await {
            match &e {
                JukeboxError::StorageError(_)
                | JukeboxError::PipelineError(_)
                | JukeboxError::LookupError(_) => {
                    warn!("Request from connection {} failed: {}", connection.id, e)
                }
                _ => info!("Request from connection {} denied: {}", connection.id, e),
            }
            self.coordinator.report_error(connection, &e).await;
        }
    }

    pub async fn dispatch(&self, connection: &Connection, text: &str) -> Result<()> {
        if text.len() > MAX_INBOUND_MESSAGE_SIZE {
            return Err(JukeboxError::MessageTooLarge(text.len()));
        }

        let message: ClientMessage = serde_json::from_str(text)?;
        trace!(
            "Connection {} sent {} for room {}",
            connection.id,
            message.kind(),
            message.space_id()
        );

        match message {
            ClientMessage::JoinRoom { token, space_id } => {
                self.coordinator
                    .join_room(connection, &token, &space_id)
                    .await
            }
            ClientMessage::AddToQueue {
                space_id,
                user_id,
                url,
            } => {
                self.coordinator
                    .add_to_queue(&connection.id, &space_id, user_id.as_deref(), &url)
                    .await
            }
            ClientMessage::CastVote {
                space_id,
                user_id,
                stream_id,
                vote,
            } => {
                self.coordinator
                    .cast_vote(
                        &connection.id,
                        &space_id,
                        user_id.as_deref(),
                        &stream_id,
                        vote,
                    )
                    .await
            }
            ClientMessage::PlayNext { space_id, user_id } => {
                self.coordinator
                    .play_next(&connection.id, &space_id, user_id.as_deref())
                    .await
            }
            ClientMessage::RemoveSong {
                space_id,
                user_id,
                stream_id,
            } => {
                self.coordinator
                    .remove_song(&connection.id, &space_id, user_id.as_deref(), &stream_id)
                    .await
            }
            ClientMessage::EmptyQueue { space_id, user_id } => {
                self.coordinator
                    .empty_queue(&connection.id, &space_id, user_id.as_deref())
                    .await
            }
            ClientMessage::PayAndPlayNext {
                space_id,
                user_id,
                url,
            } => {
                self.coordinator
                    .pay_and_play_next(&connection.id, &space_id, user_id.as_deref(), &url)
                    .await
            }
        }
    }

    /// Clean up after a closed connection
    pub async fn handle_disconnect(&self, connection: &Connection) {
        debug!(
            "Connection {} closed after {:?}",
            connection.id,
            connection.connection_duration()
        );
        self.coordinator.disconnect(&connection.id).await;
    }
}
