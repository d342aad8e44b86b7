//! Message types for the room protocol
//!
//! Inbound envelopes are `{type, data}` with kebab-case types and camelCase
//! fields. Outbound room events are typed `<kind>/<spaceId>`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const JOINED: &str = "joined";
pub const NEW_STREAM: &str = "new-stream";
pub const NEW_VOTE: &str = "new-vote";
pub const PLAY_NEXT: &str = "play-next";
pub const REMOVE_SONG: &str = "remove-song";
pub const EMPTY_QUEUE: &str = "empty-queue";
pub const ERROR: &str = "error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteDirection {
    Upvote,
    Downvote,
}

impl VoteDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteDirection::Upvote => "upvote",
            VoteDirection::Downvote => "downvote",
        }
    }
}

/// Client-to-server messages.
///
/// `user_id` on action messages is only compared against the identity bound
/// to the connection; it never selects who the action runs as.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    JoinRoom {
        token: String,
        space_id: String,
    },
    AddToQueue {
        space_id: String,
        user_id: Option<String>,
        url: String,
    },
    CastVote {
        space_id: String,
        user_id: Option<String>,
        stream_id: String,
        vote: VoteDirection,
    },
    PlayNext {
        space_id: String,
        user_id: Option<String>,
    },
    RemoveSong {
        space_id: String,
        user_id: Option<String>,
        stream_id: String,
    },
    EmptyQueue {
        space_id: String,
        user_id: Option<String>,
    },
    PayAndPlayNext {
        space_id: String,
        user_id: Option<String>,
        url: String,
    },
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::JoinRoom { .. } => "join-room",
            ClientMessage::AddToQueue { .. } => "add-to-queue",
            ClientMessage::CastVote { .. } => "cast-vote",
            ClientMessage::PlayNext { .. } => "play-next",
            ClientMessage::RemoveSong { .. } => "remove-song",
            ClientMessage::EmptyQueue { .. } => "empty-queue",
            ClientMessage::PayAndPlayNext { .. } => "pay-and-play-next",
        }
    }

    pub fn space_id(&self) -> &str {
        match self {
            ClientMessage::JoinRoom { space_id, .. }
            | ClientMessage::AddToQueue { space_id, .. }
            | ClientMessage::CastVote { space_id, .. }
            | ClientMessage::PlayNext { space_id, .. }
            | ClientMessage::RemoveSong { space_id, .. }
            | ClientMessage::EmptyQueue { space_id, .. }
            | ClientMessage::PayAndPlayNext { space_id, .. } => space_id,
        }
    }
}

/// Server-to-client event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ServerEvent {
    /// Event addressed to a room, typed `<kind>/<spaceId>`
    pub fn room(kind: &str, space_id: &str, data: Option<Value>) -> Self {
        Self {
            kind: format!("{}/{}", kind, space_id),
            data,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: ERROR.to_string(),
            data: Some(json!({ "message": message.into() })),
        }
    }

    pub fn joined(space_id: &str, user_id: &str, is_host: bool) -> Self {
        Self::room(
            JOINED,
            space_id,
            Some(json!({ "userId": user_id, "isHost": is_host })),
        )
    }

    pub fn is_error(&self) -> bool {
        self.kind == ERROR
    }

    /// Message text of an error event
    pub fn error_message(&self) -> Option<&str> {
        if !self.is_error() {
            return None;
        }
        self.data.as_ref()?.get("message")?.as_str()
    }

    pub fn to_json(&self) -> String {
        // Only strings and JSON values inside, so this cannot fail
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"type\":\"{}\"}}", self.kind))
    }
}
