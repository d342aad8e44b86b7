//! Room event log
//!
//! Worker results are appended here before their action is acked, and every
//! node's relay tails the table into its local room topics. Each action
//! appends at most one record, so a redelivered action is never announced
//! twice.

use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use super::action::PendingAction;
use super::worker::EventSink;
use crate::core::message_types::ServerEvent;
use crate::error::{JukeboxError, Result};

const ROOM: &str = "room";
const USER: &str = "user";

const SCHEMA: [&str; 2] = [
    "CREATE TABLE IF NOT EXISTS room_events (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        action_id TEXT NOT NULL UNIQUE,
        audience TEXT NOT NULL,
        target TEXT NOT NULL,
        payload TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS room_events_created
        ON room_events (created_at)",
];

/// Who a logged event is delivered to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    /// Every connection bound to the room
    Room(String),
    /// Every connection of the user
    User(String),
}

#[derive(Debug, Clone)]
pub struct LoggedEvent {
    pub seq: i64,
    pub audience: Audience,
    /// Serialized `ServerEvent`
    pub payload: String,
}

pub struct SqliteEventLog {
    pool: SqlitePool,
    appended: Arc<Notify>,
}

impl SqliteEventLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            appended: Arc::new(Notify::new()),
        }
    }

    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Signalled after each local append
    pub fn appended_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.appended)
    }

    /// Record the outcome of an action; returns false if one was already there
    pub async fn append(
        &self,
        action: &PendingAction,
        audience: Audience,
        event: &ServerEvent,
    ) -> Result<bool> {
        let (kind, target) = match &audience {
            Audience::Room(room_id) => (ROOM, room_id.as_str()),
            Audience::User(user_id) => (USER, user_id.as_str()),
        };
        let result = sqlx::query(
            "INSERT INTO room_events (action_id, audience, target, payload, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) ON CONFLICT(action_id) DO NOTHING",
        )
        .bind(action.id.to_string())
        .bind(kind)
        .bind(target)
        .bind(event.to_json())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        let appended = result.rows_affected() > 0;
        if appended {
            self.appended.notify_one();
        } else {
            debug!("Action {} already has a logged event", action.id);
        }
        Ok(appended)
    }

    /// Highest sequence number written so far, 0 for an empty log
    pub async fn latest_seq(&self) -> Result<i64> {
        let seq: Option<i64> = sqlx::query_scalar("SELECT MAX(seq) FROM room_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(seq.unwrap_or(0))
    }

    /// Events after `after` in log order
    pub async fn read_after(&self, after: i64, limit: usize) -> Result<Vec<LoggedEvent>> {
        let rows = sqlx::query(
            "SELECT seq, audience, target, payload FROM room_events \
             WHERE seq > ?1 ORDER BY seq LIMIT ?2",
        )
        .bind(after)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let kind: String = row.try_get("audience")?;
                let target: String = row.try_get("target")?;
                let audience = match kind.as_str() {
                    ROOM => Audience::Room(target),
                    USER => Audience::User(target),
                    other => {
                        return Err(JukeboxError::PipelineError(format!(
                            "unknown event audience {}",
                            other
                        )))
                    }
                };
                Ok(LoggedEvent {
                    seq: row.try_get("seq")?,
                    audience,
                    payload: row.try_get("payload")?,
                })
            })
            .collect()
    }

    /// Drop records older than `retention`; returns how many went
    pub async fn prune(&self, retention: Duration) -> Result<u64> {
        let cutoff = Utc::now()
            .timestamp_millis()
            .saturating_sub(i64::try_from(retention.as_millis()).unwrap_or(i64::MAX));
        let result = sqlx::query("DELETE FROM room_events WHERE created_at < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl EventSink for SqliteEventLog {
    async fn publish(&self, action: &PendingAction, event: &ServerEvent) -> Result<()> {
        self.append(action, Audience::Room(action.room_id.clone()), event)
            .await
            .map(|_| ())
    }

    async fn notify_user(&self, action: &PendingAction, event: &ServerEvent) -> Result<()> {
        self.append(action, Audience::User(action.user_id.clone()), event)
            .await
            .map(|_| ())
    }

    async fn recorded(&self, action: &PendingAction) -> Result<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT seq FROM room_events WHERE action_id = ?1")
                .bind(action.id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }
}
