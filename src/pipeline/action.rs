use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::message_types::VoteDirection;

/// A queue or vote change accepted by the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Mutation {
    CastVote {
        stream_id: String,
        direction: VoteDirection,
    },
    AddToQueue {
        url: String,
        media_id: String,
        /// Host of the room when the submission was accepted
        owner_id: String,
        /// Unplayed count observed when the submission was accepted
        unplayed_at_decision: usize,
    },
    PlayNext,
    RemoveSong {
        stream_id: String,
    },
    EmptyQueue,
    /// Submit a link and make it the current item straight away
    PayAndPlayNext {
        url: String,
        media_id: String,
        owner_id: String,
    },
}

impl Mutation {
    pub fn kind(&self) -> &'static str {
        match self {
            Mutation::CastVote { .. } => "cast-vote",
            Mutation::AddToQueue { .. } => "add-to-queue",
            Mutation::PlayNext => "play-next",
            Mutation::RemoveSong { .. } => "remove-song",
            Mutation::EmptyQueue => "empty-queue",
            Mutation::PayAndPlayNext { .. } => "pay-and-play-next",
        }
    }
}

/// An action waiting in the pipeline.
///
/// The id is assigned once at acceptance and never changes across
/// redeliveries; records created by the action are keyed on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAction {
    pub id: Uuid,
    /// Node that accepted the action; any node's worker may apply it
    pub origin_node: String,
    pub room_id: String,
    /// Identity the action acts as
    pub user_id: String,
    pub mutation: Mutation,
    pub enqueued_at: DateTime<Utc>,
}

impl PendingAction {
    pub fn new(
        origin_node: impl Into<String>,
        room_id: impl Into<String>,
        user_id: impl Into<String>,
        mutation: Mutation,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            origin_node: origin_node.into(),
            room_id: room_id.into(),
            user_id: user_id.into(),
            mutation,
            enqueued_at: Utc::now(),
        }
    }
}
