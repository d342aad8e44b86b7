//! Event relay
//!
//! Tails the shared event log and hands each record to this node's
//! coordinator, which delivers it to the local connections bound to the
//! room or owned by the user. Every node runs one, so members see a room's
//! events whichever node they are connected to.

use log::{debug, error, info};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use super::events::{Audience, SqliteEventLog};
use crate::constants::{EVENT_PRUNE_INTERVAL_SECS, EVENT_RETENTION_SECS, RELAY_BATCH_SIZE};
use crate::core::Coordinator;
use crate::error::Result;

pub struct EventRelay {
    log: Arc<SqliteEventLog>,
    coordinator: Arc<Coordinator>,
    /// Last sequence number handed to the coordinator
    cursor: Mutex<i64>,
    poll_interval: Duration,
}

impl EventRelay {
    /// Start from the current end of the log
    pub async fn new(
        log: Arc<SqliteEventLog>,
        coordinator: Arc<Coordinator>,
        poll_interval: Duration,
    ) -> Result<Self> {
        let cursor = log.latest_seq().await?;
        Ok(Self {
            log,
            coordinator,
            cursor: Mutex::new(cursor),
            poll_interval,
        })
    }

    /// Deliver everything logged since the last pump; returns how many records
    pub async fn pump(&self) -> Result<usize> {
        let mut cursor = self.cursor.lock().await;
        let mut relayed = 0;
        loop {
            let batch = self.log.read_after(*cursor, RELAY_BATCH_SIZE).await?;
            for event in &batch {
                let reached = match &event.audience {
                    Audience::Room(room_id) => {
                        self.coordinator.broadcast(room_id, &event.payload).await
                    }
                    Audience::User(user_id) => {
                        self.coordinator
                            .send_payload_to_user(user_id, &event.payload)
                            .await
                    }
                };
                debug!("Relayed event #{} to {} local connections", event.seq, reached);
                *cursor = event.seq;
                relayed += 1;
            }
            if batch.len() < RELAY_BATCH_SIZE {
                return Ok(relayed);
            }
        }
    }

    pub async fn run(self: Arc<Self>) {
        info!("Event relay started at #{}", *self.cursor.lock().await);
        let appended = self.log.appended_handle();
        let prune_every = Duration::from_secs(EVENT_PRUNE_INTERVAL_SECS);
        let mut last_prune = Instant::now();
        loop {
            if let Err(e) = self.pump().await {
                error!("Event relay error: {}", e);
            }
            if last_prune.elapsed() >= prune_every {
                match self.log.prune(Duration::from_secs(EVENT_RETENTION_SECS)).await {
                    Ok(0) => {}
                    Ok(pruned) => debug!("Pruned {} relayed events", pruned),
                    Err(e) => error!("Failed to prune event log: {}", e),
                }
                last_prune = Instant::now();
            }
            tokio::select! {
                _ = appended.notified() => {}
                _ = sleep(self.poll_interval) => {}
            }
        }
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
