//! In-memory storage implementation for development and testing
//!
//! Keeps queue items, votes and current-item records in process memory.
//! It can serve a single process only.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

use super::traits::*;
use crate::error::{JukeboxError, Result};

#[derive(Debug, Clone)]
struct StoredVote {
    id: String,
    user_id: String,
    item_id: String,
}

#[derive(Default)]
struct Tables {
    items: HashMap<String, (QueueItem, i64)>,
    votes: Vec<StoredVote>,
    current: HashMap<String, CurrentItem>,
    next_seq: i64,
}

#[derive(Default)]
pub struct MemoryQueueStorage {
    tables: RwLock<Tables>,
    /// Simulates an outage: every call fails with a storage error
    unavailable: AtomicBool,
}

impl MemoryQueueStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(JukeboxError::StorageError("storage unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    /// Total number of items, played or not
    pub async fn item_count(&self) -> usize {
        self.tables.read().await.items.len()
    }
}

#[async_trait]
impl QueueStorage for MemoryQueueStorage {
    async fn create_item(&self, item: NewQueueItem) -> Result<QueueItem> {
        self.check_available()?;
        let mut tables = self.tables.write().await;

        if let Some((existing, _)) = tables.items.get(&item.id) {
            return Ok(existing.clone());
        }

        tables.next_seq += 1;
        let seq = tables.next_seq;
        let stored = QueueItem {
            id: item.id.clone(),
            room_id: item.room_id,
            owner_id: item.owner_id,
            added_by: item.added_by,
            url: item.url,
            media_id: item.media_id,
            title: item.title,
            small_img: item.small_img,
            big_img: item.big_img,
            played: false,
            played_at: None,
            created_at: item.created_at,
        };
        tables.items.insert(item.id, (stored.clone(), seq));
        Ok(stored)
    }

    async fn get_item(&self, item_id: &str) -> Result<Option<QueueItem>> {
        self.check_available()?;
        let tables = self.tables.read().await;
        Ok(tables.items.get(item_id).map(|(item, _)| item.clone()))
    }

    async fn unplayed_entries(&self, room_id: &str) -> Result<Vec<QueueEntry>> {
        self.check_available()?;
        let tables = self.tables.read().await;

        let mut entries: Vec<QueueEntry> = tables
            .items
            .values()
            .filter(|(item, _)| item.room_id == room_id && !item.played)
            .map(|(item, seq)| QueueEntry {
                upvotes: tables.votes.iter().filter(|v| v.item_id == item.id).count(),
                item: item.clone(),
                seq: *seq,
            })
            .collect();
        entries.sort_by_key(|entry| entry.seq);
        Ok(entries)
    }

    async fn count_unplayed(&self, room_id: &str) -> Result<usize> {
        self.check_available()?;
        let tables = self.tables.read().await;
        Ok(tables
            .items
            .values()
            .filter(|(item, _)| item.room_id == room_id && !item.played)
            .count())
    }

    async fn mark_played(&self, item_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.check_available()?;
        let mut tables = self.tables.write().await;
        match tables.items.get_mut(item_id) {
            Some((item, _)) => {
                if !item.played {
                    item.played = true;
                    item.played_at = Some(at);
                }
                Ok(())
            }
            None => Err(JukeboxError::NotFound(format!("Stream {} not found", item_id))),
        }
    }

    async fn mark_all_played(
        &self,
        room_id: &str,
        created_before: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<usize> {
        self.check_available()?;
        let mut tables = self.tables.write().await;
        let mut marked = 0;
        for (item, _) in tables.items.values_mut() {
            if item.room_id == room_id && !item.played && item.created_at <= created_before {
                item.played = true;
                item.played_at = Some(at);
                marked += 1;
            }
        }
        Ok(marked)
    }

    async fn delete_item(&self, room_id: &str, item_id: &str) -> Result<bool> {
        self.check_available()?;
        let mut tables = self.tables.write().await;
        let in_room = tables
            .items
            .get(item_id)
            .map(|(item, _)| item.room_id == room_id)
            .unwrap_or(false);
        if !in_room {
            return Ok(false);
        }
        tables.items.remove(item_id);
        tables.votes.retain(|v| v.item_id != item_id);
        Ok(true)
    }

    async fn upsert_current(&self, current: CurrentItem) -> Result<()> {
        self.check_available()?;
        let mut tables = self.tables.write().await;
        tables.current.insert(current.room_id.clone(), current);
        Ok(())
    }

    async fn get_current(&self, room_id: &str) -> Result<Option<CurrentItem>> {
        self.check_available()?;
        let tables = self.tables.read().await;
        Ok(tables.current.get(room_id).cloned())
    }

    async fn create_vote(&self, vote_id: &str, user_id: &str, item_id: &str) -> Result<()> {
        self.check_available()?;
        let mut tables = self.tables.write().await;

        if !tables.items.contains_key(item_id) {
            return Err(JukeboxError::NotFound(format!("Stream {} not found", item_id)));
        }
        if let Some(existing) = tables
            .votes
            .iter()
            .find(|v| v.user_id == user_id && v.item_id == item_id)
        {
            if existing.id == vote_id {
                return Ok(());
            }
            return Err(JukeboxError::Conflict(
                "You have already voted for this song".to_string(),
            ));
        }

        tables.votes.push(StoredVote {
            id: vote_id.to_string(),
            user_id: user_id.to_string(),
            item_id: item_id.to_string(),
        });
        Ok(())
    }

    async fn delete_vote(&self, user_id: &str, item_id: &str) -> Result<bool> {
        self.check_available()?;
        let mut tables = self.tables.write().await;
        let before = tables.votes.len();
        tables
            .votes
            .retain(|v| !(v.user_id == user_id && v.item_id == item_id));
        Ok(tables.votes.len() != before)
    }

    async fn count_votes(&self, item_id: &str) -> Result<usize> {
        self.check_available()?;
        let tables = self.tables.read().await;
        Ok(tables.votes.iter().filter(|v| v.item_id == item_id).count())
    }
}
