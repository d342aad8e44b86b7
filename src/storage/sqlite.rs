//! SQLite-backed queue storage
//!
//! Lets several server processes share one queue through a common database
//! file. Timestamps are stored as UTC milliseconds.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;

use super::traits::*;
use crate::error::{JukeboxError, Result};

const SCHEMA: [&str; 4] = [
    "CREATE TABLE IF NOT EXISTS streams (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        space_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        added_by TEXT NOT NULL,
        url TEXT NOT NULL,
        extracted_id TEXT NOT NULL,
        title TEXT NOT NULL,
        small_img TEXT NOT NULL,
        big_img TEXT NOT NULL,
        played INTEGER NOT NULL DEFAULT 0,
        played_ts INTEGER,
        created_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS streams_space_played ON streams (space_id, played)",
    "CREATE TABLE IF NOT EXISTS upvotes (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        stream_id TEXT NOT NULL REFERENCES streams (id) ON DELETE CASCADE,
        UNIQUE (user_id, stream_id)
    )",
    "CREATE TABLE IF NOT EXISTS current_streams (
        space_id TEXT PRIMARY KEY,
        stream_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        action_id TEXT NOT NULL
    )",
];

const ITEM_COLUMNS: &str = "seq, id, space_id, user_id, added_by, url, extracted_id, title, \
                            small_img, big_img, played, played_ts, created_at";

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn item_from_row(row: &SqliteRow) -> Result<QueueItem> {
    let played_ts: Option<i64> = row.try_get("played_ts")?;
    Ok(QueueItem {
        id: row.try_get("id")?,
        room_id: row.try_get("space_id")?,
        owner_id: row.try_get("user_id")?,
        added_by: row.try_get("added_by")?,
        url: row.try_get("url")?,
        media_id: row.try_get("extracted_id")?,
        title: row.try_get("title")?,
        small_img: row.try_get("small_img")?,
        big_img: row.try_get("big_img")?,
        played: row.try_get::<i64, _>("played")? != 0,
        played_at: played_ts.map(from_millis),
        created_at: from_millis(row.try_get("created_at")?),
    })
}

/// Open a pool for `database_url`, creating the database file if needed.
/// An in-memory database lives in a single connection.
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let in_memory = database_url.contains(":memory:");
    let mut options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));
    if !in_memory {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(if in_memory { 1 } else { 5 })
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    Ok(pool)
}

pub struct SqliteQueueStorage {
    pool: SqlitePool,
}

impl SqliteQueueStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the tables if they do not exist yet
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl QueueStorage for SqliteQueueStorage {
    async fn create_item(&self, item: NewQueueItem) -> Result<QueueItem> {
        // Replays of the same action id hit the UNIQUE constraint and are ignored
        sqlx::query(
            "INSERT INTO streams (id, space_id, user_id, added_by, url, extracted_id, title, \
             small_img, big_img, played, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&item.id)
        .bind(&item.room_id)
        .bind(&item.owner_id)
        .bind(&item.added_by)
        .bind(&item.url)
        .bind(&item.media_id)
        .bind(&item.title)
        .bind(&item.small_img)
        .bind(&item.big_img)
        .bind(item.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        self.get_item(&item.id).await?.ok_or_else(|| {
            JukeboxError::StorageError(format!("Stream {} missing after insert", item.id))
        })
    }

    async fn get_item(&self, item_id: &str) -> Result<Option<QueueItem>> {
        let row = sqlx::query(&format!("SELECT {} FROM streams WHERE id = ?1", ITEM_COLUMNS))
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(item_from_row).transpose()
    }

    async fn unplayed_entries(&self, room_id: &str) -> Result<Vec<QueueEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {}, (SELECT COUNT(*) FROM upvotes u WHERE u.stream_id = s.id) AS upvotes \
             FROM streams s WHERE space_id = ?1 AND played = 0 ORDER BY seq",
            ITEM_COLUMNS
        ))
        .bind(room_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(QueueEntry {
                    item: item_from_row(row)?,
                    upvotes: row.try_get::<i64, _>("upvotes")?.max(0) as usize,
                    seq: row.try_get("seq")?,
                })
            })
            .collect()
    }

    async fn count_unplayed(&self, room_id: &str) -> Result<usize> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM streams WHERE space_id = ?1 AND played = 0")
                .bind(room_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as usize)
    }

    async fn mark_played(&self, item_id: &str, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE streams SET played = 1, played_ts = COALESCE(played_ts, ?2) WHERE id = ?1",
        )
        .bind(item_id)
        .bind(at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(JukeboxError::NotFound(format!("Stream {} not found", item_id)));
        }
        Ok(())
    }

    async fn mark_all_played(
        &self,
        room_id: &str,
        created_before: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<usize> {
        let result = sqlx::query(
            "UPDATE streams SET played = 1, played_ts = ?3 \
             WHERE space_id = ?1 AND played = 0 AND created_at <= ?2",
        )
        .bind(room_id)
        .bind(created_before.timestamp_millis())
        .bind(at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn delete_item(&self, room_id: &str, item_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM upvotes WHERE stream_id = ?1")
            .bind(item_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM streams WHERE id = ?1 AND space_id = ?2")
            .bind(item_id)
            .bind(room_id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            // Votes of an item in another room must survive
            tx.rollback().await?;
            return Ok(false);
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn upsert_current(&self, current: CurrentItem) -> Result<()> {
        sqlx::query(
            "INSERT INTO current_streams (space_id, stream_id, user_id, action_id) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT (space_id) DO UPDATE SET \
             stream_id = excluded.stream_id, user_id = excluded.user_id, action_id = excluded.action_id",
        )
        .bind(&current.room_id)
        .bind(&current.item_id)
        .bind(&current.user_id)
        .bind(&current.action_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_current(&self, room_id: &str) -> Result<Option<CurrentItem>> {
        let row = sqlx::query(
            "SELECT space_id, stream_id, user_id, action_id FROM current_streams WHERE space_id = ?1",
        )
        .bind(room_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(CurrentItem {
                room_id: row.try_get("space_id")?,
                item_id: row.try_get("stream_id")?,
                user_id: row.try_get("user_id")?,
                action_id: row.try_get("action_id")?,
            })),
            None => Ok(None),
        }
    }

    async fn create_vote(&self, vote_id: &str, user_id: &str, item_id: &str) -> Result<()> {
        if self.get_item(item_id).await?.is_none() {
            return Err(JukeboxError::NotFound(format!("Stream {} not found", item_id)));
        }

        let existing: Option<String> =
            sqlx::query_scalar("SELECT id FROM upvotes WHERE user_id = ?1 AND stream_id = ?2")
                .bind(user_id)
                .bind(item_id)
                .fetch_optional(&self.pool)
                .await?;
        if let Some(existing) = existing {
            if existing == vote_id {
                return Ok(());
            }
            return Err(JukeboxError::Conflict(
                "You have already voted for this song".to_string(),
            ));
        }

        let inserted = sqlx::query(
            "INSERT INTO upvotes (id, user_id, stream_id) VALUES (?1, ?2, ?3) \
             ON CONFLICT DO NOTHING",
        )
        .bind(vote_id)
        .bind(user_id)
        .bind(item_id)
        .execute(&self.pool)
        .await?;

        // Lost a race with another vote on the same pair
        if inserted.rows_affected() == 0 {
            return Err(JukeboxError::Conflict(
                "You have already voted for this song".to_string(),
            ));
        }
        Ok(())
    }

    async fn delete_vote(&self, user_id: &str, item_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM upvotes WHERE user_id = ?1 AND stream_id = ?2")
            .bind(user_id)
            .bind(item_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn count_votes(&self, item_id: &str) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM upvotes WHERE stream_id = ?1")
            .bind(item_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as usize)
    }
}
