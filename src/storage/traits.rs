//! Storage collaborator interfaces
//!
//! Queue items and votes are owned by storage; the coordinator only holds
//! transient copies returned from queries. Only the mutation worker calls the
//! writing methods.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A submitted media reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: String,
    #[serde(rename = "spaceId")]
    pub room_id: String,
    /// Identity the item was created under (normally the host)
    #[serde(rename = "userId")]
    pub owner_id: String,
    pub added_by: String,
    pub url: String,
    #[serde(rename = "extractedId")]
    pub media_id: String,
    pub title: String,
    pub small_img: String,
    pub big_img: String,
    pub played: bool,
    #[serde(rename = "playedTs")]
    pub played_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Fields needed to create an item; the id comes from the pipeline action
#[derive(Debug, Clone)]
pub struct NewQueueItem {
    pub id: String,
    pub room_id: String,
    pub owner_id: String,
    pub added_by: String,
    pub url: String,
    pub media_id: String,
    pub title: String,
    pub small_img: String,
    pub big_img: String,
    /// When the submission was accepted, which fixes its place in the queue
    pub created_at: DateTime<Utc>,
}

/// An item with its vote count and insertion sequence
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub item: QueueItem,
    pub upvotes: usize,
    pub seq: i64,
}

/// The item a room is currently playing
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentItem {
    pub room_id: String,
    pub item_id: String,
    pub user_id: String,
    /// Pipeline action that set this record
    pub action_id: String,
}

#[async_trait]
pub trait QueueStorage: Send + Sync {
    /// Create an item. Creating an existing id again returns the stored item.
    async fn create_item(&self, item: NewQueueItem) -> Result<QueueItem>;

    async fn get_item(&self, item_id: &str) -> Result<Option<QueueItem>>;

    /// Unplayed items of a room with their vote counts
    async fn unplayed_entries(&self, room_id: &str) -> Result<Vec<QueueEntry>>;

    async fn count_unplayed(&self, room_id: &str) -> Result<usize>;

    /// Mark one item played; idempotent
    async fn mark_played(&self, item_id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Mark every unplayed item created before `created_before` as played
    async fn mark_all_played(
        &self,
        room_id: &str,
        created_before: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<usize>;

    /// Delete an item scoped to a room; Ok(false) if it did not exist
    async fn delete_item(&self, room_id: &str, item_id: &str) -> Result<bool>;

    async fn upsert_current(&self, current: CurrentItem) -> Result<()>;

    async fn get_current(&self, room_id: &str) -> Result<Option<CurrentItem>>;

    /// Create a vote. Replaying the same vote id succeeds; a different id for
    /// the same (user, item) pair is a conflict.
    async fn create_vote(&self, vote_id: &str, user_id: &str, item_id: &str) -> Result<()>;

    /// Delete the vote for a pair; Ok(false) if there was none
    async fn delete_vote(&self, user_id: &str, item_id: &str) -> Result<bool>;

    async fn count_votes(&self, item_id: &str) -> Result<usize>;
}
