//! Mutation worker
//!
//! The only writer of queue items, votes and current-item records. Applies
//! one delivery at a time and records its result with an [`EventSink`]
//! before acking, so an action that is acked has always been announced.
//! Every action is safe to apply twice: records are keyed on the action id.

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use super::action::{Mutation, PendingAction};
use super::queue::{ActionQueue, Delivery};
use crate::config::PipelineConfig;
use crate::constants::FALLBACK_TITLE;
use crate::core::message_types::{
    ServerEvent, VoteDirection, EMPTY_QUEUE, NEW_STREAM, NEW_VOTE, PLAY_NEXT, REMOVE_SONG,
};
use crate::core::queue_selector::select_next;
use crate::error::{JukeboxError, Result};
use crate::storage::{
    pick_images, CurrentItem, MediaMetadata, MetadataLookup, NewQueueItem, QueueItem,
    QueueStorage,
};

/// Where worker results go. Both calls must be durable when they return
/// and must record at most one event per action.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Announce the action's result to every member of its room
    async fn publish(&self, action: &PendingAction, event: &ServerEvent) -> Result<()>;

    /// Tell the action's issuer, on every connection they have
    async fn notify_user(&self, action: &PendingAction, event: &ServerEvent) -> Result<()>;

    /// Whether an outcome of the action is already recorded
    async fn recorded(&self, action: &PendingAction) -> Result<bool>;
}

pub struct MutationWorker {
    storage: Arc<dyn QueueStorage>,
    lookup: Arc<dyn MetadataLookup>,
    queue: Arc<dyn ActionQueue>,
    sink: Arc<dyn EventSink>,
    config: PipelineConfig,
    wake: Arc<Notify>,
}

impl MutationWorker {
    pub fn new(
        storage: Arc<dyn QueueStorage>,
        lookup: Arc<dyn MetadataLookup>,
        queue: Arc<dyn ActionQueue>,
        sink: Arc<dyn EventSink>,
        config: PipelineConfig,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            storage,
            lookup,
            queue,
            sink,
            config,
            wake,
        }
    }

    /// Claim and apply one action. Returns false when nothing was deliverable.
    pub async fn process_next(&self) -> Result<bool> {
        let Some(delivery) = self.queue.claim().await? else {
            return Ok(false);
        };
        let action = &delivery.action;
        debug!(
            "Applying {} action {} for room {} (attempt {})",
            action.mutation.kind(),
            action.id,
            action.room_id,
            delivery.attempt
        );

        if delivery.attempt > 1 && self.sink.recorded(action).await? {
            // An earlier attempt finished and only its ack was lost
            debug!("Action {} already settled, acking", action.id);
            self.queue.ack(&delivery).await?;
            return Ok(true);
        }

        let settled = match self.apply(action).await {
            Ok(event) => self.settle(&delivery, event).await,
            Err(e) if e.is_transient() && delivery.attempt < self.config.max_attempts => {
                let delay = self.config.retry_delay(delivery.attempt);
                warn!(
                    "Action {} failed on attempt {}, retrying in {:?}: {}",
                    action.id, delivery.attempt, delay, e
                );
                self.queue.retry(&delivery, delay).await?;
                return Ok(true);
            }
            Err(e) => self.reject(&delivery, e).await,
        };

        if let Err(e) = settled {
            // Applying again is harmless and the sink keeps one event per action
            let delay = self.config.retry_delay(delivery.attempt);
            warn!(
                "Could not settle action {}, redelivering in {:?}: {}",
                action.id, delay, e
            );
            self.queue.retry(&delivery, delay).await?;
        }
        Ok(true)
    }

    /// Record the result, then ack
    async fn settle(&self, delivery: &Delivery, event: Option<ServerEvent>) -> Result<()> {
        if let Some(event) = event {
            self.sink.publish(&delivery.action, &event).await?;
        }
        self.queue.ack(delivery).await
    }

    /// Apply everything currently deliverable; returns how many were handled
    pub async fn drain(&self) -> Result<usize> {
        let mut handled = 0;
        while self.process_next().await? {
            handled += 1;
        }
        Ok(handled)
    }

    /// Process actions until the task is aborted
    pub async fn run(self: Arc<Self>) {
        info!("Mutation worker started");
        loop {
            match self.process_next().await {
                Ok(true) => continue,
                Ok(false) => {
                    tokio::select! {
                        _ = self.wake.notified() => {}
                        _ = sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    error!("Mutation worker error: {}", e);
                    sleep(self.config.poll_interval).await;
                }
            }
        }
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Drop an action that will not succeed and tell the issuer why
    async fn reject(&self, delivery: &Delivery, e: JukeboxError) -> Result<()> {
        let action = &delivery.action;
        if e.is_transient() {
            error!(
                "Dead-lettering action {} after {} attempts: {}",
                action.id, delivery.attempt, e
            );
        } else {
            info!("Action {} rejected: {}", action.id, e);
        }
        self.sink
            .notify_user(action, &ServerEvent::error(e.client_message()))
            .await?;
        self.queue.ack(delivery).await
    }

    async fn apply(&self, action: &PendingAction) -> Result<Option<ServerEvent>> {
        match &action.mutation {
            Mutation::CastVote {
                stream_id,
                direction,
            } => self.cast_vote(action, stream_id, *direction).await,
            Mutation::AddToQueue {
                url,
                media_id,
                owner_id,
                unplayed_at_decision,
            } => {
                self.add_to_queue(action, url, media_id, owner_id, *unplayed_at_decision)
                    .await
            }
            Mutation::PlayNext => self.play_next(action).await,
            Mutation::PayAndPlayNext {
                url,
                media_id,
                owner_id,
            } => {
                self.pay_and_play_next(action, url, media_id, owner_id)
                    .await
            }
            Mutation::RemoveSong { stream_id } => {
                let removed = self.storage.delete_item(&action.room_id, stream_id).await?;
                if !removed {
                    debug!("remove-song for unknown stream {} ignored", stream_id);
                    return Ok(None);
                }
                Ok(Some(ServerEvent::room(
                    REMOVE_SONG,
                    &action.room_id,
                    Some(json!({ "streamId": stream_id, "spaceId": action.room_id })),
                )))
            }
            Mutation::EmptyQueue => {
                let marked = self
                    .storage
                    .mark_all_played(&action.room_id, action.enqueued_at, Utc::now())
                    .await?;
                debug!("Emptied {} items in room {}", marked, action.room_id);
                Ok(Some(ServerEvent::room(EMPTY_QUEUE, &action.room_id, None)))
            }
        }
    }

    async fn cast_vote(
        &self,
        action: &PendingAction,
        stream_id: &str,
        direction: VoteDirection,
    ) -> Result<Option<ServerEvent>> {
        let in_room = self
            .storage
            .get_item(stream_id)
            .await?
            .map(|item| item.room_id == action.room_id)
            .unwrap_or(false);
        if !in_room {
            return Err(JukeboxError::NotFound("Song not found".to_string()));
        }

        match direction {
            VoteDirection::Upvote => {
                self.storage
                    .create_vote(&action.id.to_string(), &action.user_id, stream_id)
                    .await?;
            }
            VoteDirection::Downvote => {
                if !self.storage.delete_vote(&action.user_id, stream_id).await? {
                    return Ok(None);
                }
            }
        }

        Ok(Some(ServerEvent::room(
            NEW_VOTE,
            &action.room_id,
            Some(json!({
                "vote": direction.as_str(),
                "streamId": stream_id,
                "votedBy": action.user_id,
                "spaceId": action.room_id,
            })),
        )))
    }

    async fn add_to_queue(
        &self,
        action: &PendingAction,
        url: &str,
        media_id: &str,
        owner_id: &str,
        unplayed_at_decision: usize,
    ) -> Result<Option<ServerEvent>> {
        let item = self.ensure_item(action, url, media_id, owner_id).await?;

        let mut data = serde_json::to_value(&item)
            .map_err(|e| JukeboxError::PipelineError(e.to_string()))?;
        if let Value::Object(fields) = &mut data {
            fields.insert("upvotes".to_string(), json!(0));
            fields.insert("hasUpvoted".to_string(), json!(false));
            fields.insert("queuePosition".to_string(), json!(unplayed_at_decision + 1));
        }
        Ok(Some(ServerEvent::room(NEW_STREAM, &action.room_id, Some(data))))
    }

    /// The item an action submits, created on first application
    async fn ensure_item(
        &self,
        action: &PendingAction,
        url: &str,
        media_id: &str,
        owner_id: &str,
    ) -> Result<QueueItem> {
        let item_id = action.id.to_string();
        if let Some(existing) = self.storage.get_item(&item_id).await? {
            return Ok(existing);
        }

        let metadata = self.resolve_metadata(media_id).await?;
        let (small_img, big_img) = pick_images(&metadata.thumbnails);
        let title = metadata
            .title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| FALLBACK_TITLE.to_string());

        self.storage
            .create_item(NewQueueItem {
                id: item_id,
                room_id: action.room_id.clone(),
                owner_id: owner_id.to_string(),
                added_by: action.user_id.clone(),
                url: url.to_string(),
                media_id: media_id.to_string(),
                title,
                small_img,
                big_img,
                created_at: action.enqueued_at,
            })
            .await
    }

    /// A missing video fails the submission; an unreachable lookup only costs
    /// the display metadata.
    async fn resolve_metadata(&self, media_id: &str) -> Result<MediaMetadata> {
        match self.lookup.lookup(media_id).await {
            Ok(metadata) => Ok(metadata),
            Err(JukeboxError::NotFound(_)) => {
                Err(JukeboxError::NotFound("Video not found".to_string()))
            }
            Err(e) if e.is_transient() => {
                warn!("Metadata lookup for {} failed, using fallback: {}", media_id, e);
                Ok(MediaMetadata::default())
            }
            Err(e) => Err(e),
        }
    }

    /// Skip the queue: the submitted link becomes the current item at once
    async fn pay_and_play_next(
        &self,
        action: &PendingAction,
        url: &str,
        media_id: &str,
        owner_id: &str,
    ) -> Result<Option<ServerEvent>> {
        let item = self.ensure_item(action, url, media_id, owner_id).await?;
        self.storage
            .upsert_current(CurrentItem {
                room_id: action.room_id.clone(),
                item_id: item.id.clone(),
                user_id: action.user_id.clone(),
                action_id: action.id.to_string(),
            })
            .await?;
        self.storage.mark_played(&item.id, Utc::now()).await?;
        Ok(Some(ServerEvent::room(PLAY_NEXT, &action.room_id, None)))
    }

    async fn play_next(&self, action: &PendingAction) -> Result<Option<ServerEvent>> {
        let action_id = action.id.to_string();
        let event = ServerEvent::room(PLAY_NEXT, &action.room_id, None);

        if let Some(current) = self.storage.get_current(&action.room_id).await? {
            if current.action_id == action_id {
                // Redelivery: finish the earlier attempt instead of advancing again
                self.storage.mark_played(&current.item_id, Utc::now()).await?;
                return Ok(Some(event));
            }
        }

        let entries = self.storage.unplayed_entries(&action.room_id).await?;
        let next = select_next(&entries).ok_or(JukeboxError::QueueEmpty)?;

        self.storage
            .upsert_current(CurrentItem {
                room_id: action.room_id.clone(),
                item_id: next.item.id.clone(),
                user_id: action.user_id.clone(),
                action_id,
            })
            .await?;
        self.storage.mark_played(&next.item.id, Utc::now()).await?;
        Ok(Some(event))
    }
}
