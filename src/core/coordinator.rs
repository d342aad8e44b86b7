//! Room coordinator
//!
//! Owns the session registry, room state and rate limiter of this process.
//! Joins and leaves are applied directly; queue and vote changes are gated
//! here and then handed to the mutation pipeline, whose results come back
//! through the event relay. Locks are always taken in
//! the order sessions, rooms, limiter, forwarders.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::AbortHandle;
use tokio::time::interval;

use crate::auth::TokenManager;
use crate::config::{RoomPolicy, ServerConfig};
use crate::core::connection::{Connection, ConnectionId};
use crate::core::fanout::spawn_forwarder;
use crate::core::media::validate_media_link;
use crate::core::message_types::{ServerEvent, VoteDirection};
use crate::core::rate_limiter::{RateLimiter, Reservation};
use crate::core::room::RoomManager;
use crate::core::session::SessionRegistry;
use crate::error::{JukeboxError, Result};
use crate::pipeline::{ActionQueue, Mutation, PendingAction};
use crate::storage::QueueStorage;

const UNAUTHORIZED: &str = "You are unauthorized to perform this action";
const NOT_HOST: &str = "You can't perform this action.";
const NOT_HOST_REMOVE: &str = "You cant remove the song . You are not the host";

pub struct Coordinator {
    sessions: RwLock<SessionRegistry>,
    rooms: RwLock<RoomManager>,
    limiter: Mutex<RateLimiter>,
    forwarders: Mutex<HashMap<ConnectionId, AbortHandle>>,
    tokens: TokenManager,
    storage: Arc<dyn QueueStorage>,
    queue: Arc<dyn ActionQueue>,
    /// Shared with the local mutation worker
    wake: Arc<Notify>,
    node_id: String,
}

impl Coordinator {
    pub fn new(
        tokens: TokenManager,
        storage: Arc<dyn QueueStorage>,
        queue: Arc<dyn ActionQueue>,
        policy: RoomPolicy,
        node_id: impl Into<String>,
        topic_capacity: usize,
    ) -> Self {
        Self {
            sessions: RwLock::new(SessionRegistry::new()),
            rooms: RwLock::new(RoomManager::new(topic_capacity)),
            limiter: Mutex::new(RateLimiter::new(policy)),
            forwarders: Mutex::new(HashMap::new()),
            tokens,
            storage,
            queue,
            wake: Arc::new(Notify::new()),
            node_id: node_id.into(),
        }
    }

    pub fn from_config(
        config: &ServerConfig,
        storage: Arc<dyn QueueStorage>,
        queue: Arc<dyn ActionQueue>,
    ) -> Self {
        Self::new(
            TokenManager::new(&config.jwt_secret),
            storage,
            queue,
            config.policy.clone(),
            config.pipeline.node_id.clone(),
            config.room_topic_capacity,
        )
    }

    /// Notifier the local worker waits on
    pub fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Verify a join claim and add the connection's user to the room
    pub async fn join_room(&self, connection: &Connection, token: &str, space_id: &str) -> Result<()> {
        let claims = self.tokens.verify_join_token(token, space_id)?;
        let user_id = claims.user_id.as_str();

        let mut sessions = self.sessions.write().await;
        let mut rooms = self.rooms.write().await;

        // Host check first so a rejected claim changes nothing
        let is_host = rooms.join(space_id, &claims.creator_id, user_id)?.is_host(user_id);

        let previous_user = sessions.user_for(&connection.id).map(str::to_string);
        let previous_room = sessions.room_for(&connection.id).map(str::to_string);

        sessions.register(user_id, connection.clone(), token);
        sessions.bind_room(&connection.id, space_id);

        if let (Some(old_user), Some(old_room)) = (&previous_user, &previous_room) {
            let moved = old_user != user_id || old_room != space_id;
            if moved && !sessions.user_bound_to_room(old_user, old_room) {
                rooms.leave(old_room, old_user);
                debug!("User {} left room {} after rebinding a connection", old_user, old_room);
            }
        }

        let already_subscribed = previous_room.as_deref() == Some(space_id);
        let mut forwarders = self.forwarders.lock().await;
        if !already_subscribed || !forwarders.contains_key(&connection.id) {
            if let Some(room) = rooms.get(space_id) {
                let handle =
                    spawn_forwarder(space_id.to_string(), room.topic.subscribe(), connection.clone());
                if let Some(old) = forwarders.insert(connection.id.clone(), handle) {
                    old.abort();
                }
            }
        }
        drop(forwarders);
        drop(rooms);
        drop(sessions);

        info!(
            "User {} joined room {} on connection {} (host: {})",
            user_id, space_id, connection.id, is_host
        );
        connection.send_text(&ServerEvent::joined(space_id, user_id, is_host).to_json());
        Ok(())
    }

    /// Forget a closed connection; the user leaves the room once none of
    /// their connections is bound to it
    pub async fn disconnect(&self, connection_id: &str) {
        let mut sessions = self.sessions.write().await;
        let mut rooms = self.rooms.write().await;

        let gone = sessions.unregister(connection_id);
        if let (Some(user_id), Some(room_id)) = (&gone.user_id, &gone.room_id) {
            if !sessions.user_bound_to_room(user_id, room_id) && rooms.leave(room_id, user_id) {
                info!("User {} left room {}", user_id, room_id);
            }
        }
        if gone.user_removed {
            debug!("Removed session for user {:?}", gone.user_id);
        }

        if let Some(handle) = self.forwarders.lock().await.remove(connection_id) {
            handle.abort();
        }
    }

    /// Resolve who an action runs as: the identity bound at join, which must
    /// be a member of the room and match any claimed id
    async fn acting_user(
        &self,
        connection_id: &str,
        space_id: &str,
        claimed: Option<&str>,
    ) -> Result<(String, bool)> {
        let sessions = self.sessions.read().await;
        let rooms = self.rooms.read().await;

        let user_id = sessions
            .user_for(connection_id)
            .ok_or_else(|| JukeboxError::Unauthorized(UNAUTHORIZED.to_string()))?;
        if claimed.map(|claimed| claimed != user_id).unwrap_or(false) {
            warn!(
                "Connection {} claimed user {:?} but is bound to {}",
                connection_id, claimed, user_id
            );
            return Err(JukeboxError::Unauthorized(UNAUTHORIZED.to_string()));
        }
        if !rooms.is_member(space_id, user_id) {
            return Err(JukeboxError::Unauthorized(UNAUTHORIZED.to_string()));
        }
        Ok((user_id.to_string(), rooms.is_host(space_id, user_id)))
    }

    async fn require_host(
        &self,
        connection_id: &str,
        space_id: &str,
        claimed: Option<&str>,
        denial: &str,
    ) -> Result<String> {
        let (user_id, is_host) = self.acting_user(connection_id, space_id, claimed).await?;
        if !is_host {
            info!("Non-host {} denied host action in room {}", user_id, space_id);
            return Err(JukeboxError::PermissionDenied(denial.to_string()));
        }
        Ok(user_id)
    }

    /// Hand an accepted action to the pipeline, undoing its reservation if
    /// it never got there
    async fn submit(&self, action: PendingAction, reservation: Reservation) -> Result<()> {
        if let Err(e) = self.queue.enqueue(&action).await {
            warn!("Failed to enqueue {} action: {}", action.mutation.kind(), e);
            self.limiter.lock().await.release(reservation);
            return Err(e);
        }
        debug!(
            "Enqueued {} action {} for room {}",
            action.mutation.kind(),
            action.id,
            action.room_id
        );
        self.wake.notify_one();
        Ok(())
    }

    pub async fn add_to_queue(
        &self,
        connection_id: &str,
        space_id: &str,
        claimed_user: Option<&str>,
        url: &str,
    ) -> Result<()> {
        let (user_id, is_host) = self.acting_user(connection_id, space_id, claimed_user).await?;
        let media_id = validate_media_link(url)?;
        let url = url.trim();

        let unplayed = self.storage.count_unplayed(space_id).await?;
        let owner_id = self
            .rooms
            .read()
            .await
            .host_of(space_id)
            .unwrap_or(user_id.as_str())
            .to_string();

        let reservation = self.limiter.lock().await.reserve_submission(
            space_id,
            &user_id,
            url,
            unplayed,
            is_host,
            Instant::now(),
        )?;

        let action = PendingAction::new(
            self.node_id.as_str(),
            space_id,
            user_id,
            Mutation::AddToQueue {
                url: url.to_string(),
                media_id,
                owner_id,
                unplayed_at_decision: unplayed,
            },
        );
        self.submit(action, reservation).await
    }

    pub async fn cast_vote(
        &self,
        connection_id: &str,
        space_id: &str,
        claimed_user: Option<&str>,
        stream_id: &str,
        direction: VoteDirection,
    ) -> Result<()> {
        let (user_id, is_host) = self.acting_user(connection_id, space_id, claimed_user).await?;
        let reservation =
            self.limiter
                .lock()
                .await
                .reserve_vote(space_id, &user_id, is_host, Instant::now())?;

        let action = PendingAction::new(
            self.node_id.as_str(),
            space_id,
            user_id,
            Mutation::CastVote {
                stream_id: stream_id.to_string(),
                direction,
            },
        );
        self.submit(action, reservation).await
    }

    pub async fn play_next(
        &self,
        connection_id: &str,
        space_id: &str,
        claimed_user: Option<&str>,
    ) -> Result<()> {
        let user_id = self
            .require_host(connection_id, space_id, claimed_user, NOT_HOST)
            .await?;
        let action = PendingAction::new(self.node_id.as_str(), space_id, user_id, Mutation::PlayNext);
        self.submit(action, Reservation::exempt()).await
    }

    pub async fn remove_song(
        &self,
        connection_id: &str,
        space_id: &str,
        claimed_user: Option<&str>,
        stream_id: &str,
    ) -> Result<()> {
        let user_id = self
            .require_host(connection_id, space_id, claimed_user, NOT_HOST_REMOVE)
            .await?;
        let action = PendingAction::new(
            self.node_id.as_str(),
            space_id,
            user_id,
            Mutation::RemoveSong {
                stream_id: stream_id.to_string(),
            },
        );
        self.submit(action, Reservation::exempt()).await
    }

    /// Submit a link that becomes the current item straight away. Open to any
    /// member and exempt from the submission limits.
    pub async fn pay_and_play_next(
        &self,
        connection_id: &str,
        space_id: &str,
        claimed_user: Option<&str>,
        url: &str,
    ) -> Result<()> {
        let (user_id, _) = self.acting_user(connection_id, space_id, claimed_user).await?;
        let media_id = validate_media_link(url)?;
        let owner_id = self
            .rooms
            .read()
            .await
            .host_of(space_id)
            .unwrap_or(user_id.as_str())
            .to_string();

        let action = PendingAction::new(
            self.node_id.as_str(),
            space_id,
            user_id,
            Mutation::PayAndPlayNext {
                url: url.trim().to_string(),
                media_id,
                owner_id,
            },
        );
        self.submit(action, Reservation::exempt()).await
    }

    pub async fn empty_queue(
        &self,
        connection_id: &str,
        space_id: &str,
        claimed_user: Option<&str>,
    ) -> Result<()> {
        let user_id = self
            .require_host(connection_id, space_id, claimed_user, NOT_HOST)
            .await?;
        let action =
            PendingAction::new(self.node_id.as_str(), space_id, user_id, Mutation::EmptyQueue);
        self.submit(action, Reservation::exempt()).await
    }

    /// Send an error to the user owning the connection, or to the bare
    /// connection if it never joined
    pub async fn report_error(&self, connection: &Connection, error: &JukeboxError) {
        let event = ServerEvent::error(error.client_message());
        let user_id = self
            .sessions
            .read()
            .await
            .user_for(&connection.id)
            .map(str::to_string);
        match user_id {
            Some(user_id) => {
                self.send_to_user(&user_id, &event).await;
            }
            None => {
                connection.send_text(&event.to_json());
            }
        }
    }

    /// Queue an event on every connection of a user; returns how many took it
    pub async fn send_to_user(&self, user_id: &str, event: &ServerEvent) -> usize {
        self.send_payload_to_user(user_id, &event.to_json()).await
    }

    pub async fn send_payload_to_user(&self, user_id: &str, payload: &str) -> usize {
        let connections = self.sessions.read().await.connections_of(user_id);
        connections
            .iter()
            .filter(|connection| connection.send_text(payload))
            .count()
    }

    /// Publish a serialized event to the connections bound to a room on this
    /// node; returns how many subscribers it reached
    pub async fn broadcast(&self, room_id: &str, payload: &str) -> usize {
        self.rooms.read().await.publish(room_id, payload)
    }

    /// Evict rooms that have been empty past the grace period and prune
    /// expired blocklist entries
    pub async fn sweep_idle_rooms(&self, grace: Duration) -> Vec<String> {
        let evicted = self.rooms.write().await.evict_idle(grace);
        let mut limiter = self.limiter.lock().await;
        for room_id in &evicted {
            limiter.forget_room(room_id);
        }
        let pruned = limiter.prune(Instant::now());
        if pruned > 0 {
            debug!("Pruned {} expired blocklist entries", pruned);
        }
        evicted
    }

    pub fn start_cleanup_task(self: Arc<Self>, sweep_interval: Duration, grace: Duration) {
        tokio::spawn(async move {
            let mut ticker = interval(sweep_interval);
            loop {
                ticker.tick().await;
                let evicted = self.sweep_idle_rooms(grace).await;
                if !evicted.is_empty() {
                    info!("Evicted {} idle rooms", evicted.len());
                }
            }
        });
    }

    pub async fn is_member(&self, space_id: &str, user_id: &str) -> bool {
        self.rooms.read().await.is_member(space_id, user_id)
    }

    pub async fn is_host(&self, space_id: &str, user_id: &str) -> bool {
        self.rooms.read().await.is_host(space_id, user_id)
    }

    pub async fn host_of(&self, space_id: &str) -> Option<String> {
        self.rooms.read().await.host_of(space_id).map(str::to_string)
    }

    pub async fn member_count(&self, space_id: &str) -> usize {
        self.rooms
            .read()
            .await
            .get(space_id)
            .map(|room| room.member_count())
            .unwrap_or(0)
    }

    pub async fn has_room(&self, space_id: &str) -> bool {
        self.rooms.read().await.get(space_id).is_some()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.room_count()
    }

    pub async fn has_user(&self, user_id: &str) -> bool {
        self.sessions.read().await.has_user(user_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.sessions.read().await.connection_count()
    }
}
