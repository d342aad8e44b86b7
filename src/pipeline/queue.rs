//! Durable action queue
//!
//! One table shared by every node. Rows are delivered at least once: a
//! claimed row is leased, and a lease that runs out without an ack makes the
//! row claimable again. A room's actions are delivered strictly in acceptance
//! order, retries included, whichever node accepted them and whichever
//! worker claims them: a row is only claimable once no older row of its room
//! is left.

use async_trait::async_trait;
use chrono::Utc;
use log::{error, warn};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::time::Duration;

use super::action::PendingAction;
use crate::error::{JukeboxError, Result};

/// A claimed action together with its delivery bookkeeping
#[derive(Debug, Clone)]
pub struct Delivery {
    pub seq: i64,
    pub action: PendingAction,
    /// 1 on first delivery
    pub attempt: u32,
}

#[async_trait]
pub trait ActionQueue: Send + Sync {
    async fn enqueue(&self, action: &PendingAction) -> Result<()>;

    /// Lease the next deliverable action, if any
    async fn claim(&self) -> Result<Option<Delivery>>;

    /// Remove a processed action
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Release the lease and make the action deliverable again after `delay`
    async fn retry(&self, delivery: &Delivery, delay: Duration) -> Result<()>;

    async fn pending_count(&self) -> Result<usize>;
}

const SCHEMA: [&str; 2] = [
    "CREATE TABLE IF NOT EXISTS pending_actions (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        origin_node TEXT NOT NULL,
        room_id TEXT NOT NULL,
        payload TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        available_at INTEGER NOT NULL,
        claimed_until INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS pending_actions_room
        ON pending_actions (room_id, seq)",
];

const CLAIM: &str = "UPDATE pending_actions
    SET claimed_until = ?1, attempts = attempts + 1
    WHERE seq = (
        SELECT p.seq FROM pending_actions p
        WHERE p.available_at <= ?2
          AND (p.claimed_until IS NULL OR p.claimed_until <= ?2)
          AND NOT EXISTS (
              SELECT 1 FROM pending_actions o
              WHERE o.room_id = p.room_id AND o.seq < p.seq
          )
        ORDER BY p.seq
        LIMIT 1
    )
    RETURNING seq, payload, attempts";

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

pub struct SqliteActionQueue {
    pool: SqlitePool,
    lease: Duration,
}

impl SqliteActionQueue {
    pub fn new(pool: SqlitePool, lease: Duration) -> Self {
        Self { pool, lease }
    }

    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn delete(&self, seq: i64) -> Result<()> {
        sqlx::query("DELETE FROM pending_actions WHERE seq = ?1")
            .bind(seq)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ActionQueue for SqliteActionQueue {
    async fn enqueue(&self, action: &PendingAction) -> Result<()> {
        let payload = serde_json::to_string(action)
            .map_err(|e| JukeboxError::PipelineError(e.to_string()))?;

        sqlx::query(
            "INSERT INTO pending_actions (id, origin_node, room_id, payload, attempts, available_at) \
             VALUES (?1, ?2, ?3, ?4, 0, ?5)",
        )
        .bind(action.id.to_string())
        .bind(&action.origin_node)
        .bind(&action.room_id)
        .bind(payload)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim(&self) -> Result<Option<Delivery>> {
        loop {
            let now = Utc::now().timestamp_millis();
            let row = sqlx::query(CLAIM)
                .bind(now.saturating_add(millis(self.lease)))
                .bind(now)
                .fetch_optional(&self.pool)
                .await?;

            let Some(row) = row else {
                return Ok(None);
            };
            let seq: i64 = row.try_get("seq")?;
            let payload: String = row.try_get("payload")?;
            let attempts: i64 = row.try_get("attempts")?;

            match serde_json::from_str::<PendingAction>(&payload) {
                Ok(action) => {
                    return Ok(Some(Delivery {
                        seq,
                        action,
                        attempt: u32::try_from(attempts).unwrap_or(u32::MAX),
                    }))
                }
                Err(e) => {
                    // Would block its room forever
                    error!("Dead-lettering undecodable action #{}: {}", seq, e);
                    self.delete(seq).await?;
                }
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.delete(delivery.seq).await
    }

    async fn retry(&self, delivery: &Delivery, delay: Duration) -> Result<()> {
        let available_at = Utc::now().timestamp_millis().saturating_add(millis(delay));
        let result = sqlx::query(
            "UPDATE pending_actions SET claimed_until = NULL, available_at = ?2 WHERE seq = ?1",
        )
        .bind(delivery.seq)
        .bind(available_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            warn!(
                "Retry of action {} found no pending row",
                delivery.action.id
            );
        }
        Ok(())
    }

    async fn pending_count(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pending_actions")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as usize)
    }
}
