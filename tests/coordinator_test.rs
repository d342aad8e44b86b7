use async_trait::async_trait;
use serde_json::Value;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use warp::ws::Message;

use rusty_jukebox::auth::{JoinClaims, TokenManager};
use rusty_jukebox::config::{PipelineConfig, RoomPolicy};
use rusty_jukebox::core::{Connection, Coordinator, VoteDirection};
use rusty_jukebox::pipeline::{
    ActionQueue, Delivery, EventRelay, MutationWorker, PendingAction, SqliteActionQueue,
    SqliteEventLog,
};
use rusty_jukebox::storage::{
    self, CurrentItem, MediaMetadata, MemoryQueueStorage, MetadataLookup, NewQueueItem,
    QueueStorage, Thumbnail,
};
use rusty_jukebox::{JukeboxError, Result};

const SECRET: &str = "coordinator-test-secret-0123456789abcdef";
const SPACE: &str = "space-1";
const NODE: &str = "test-node";

struct StubLookup;

#[async_trait]
impl MetadataLookup for StubLookup {
    async fn lookup(&self, media_id: &str) -> Result<MediaMetadata> {
        if media_id == "missing0000" {
            return Err(JukeboxError::NotFound("no such video".to_string()));
        }
        Ok(MediaMetadata {
            title: Some(format!("Video {}", media_id)),
            thumbnails: vec![
                Thumbnail {
                    url: "https://img.example/large.jpg".to_string(),
                    width: 1280,
                },
                Thumbnail {
                    url: "https://img.example/small.jpg".to_string(),
                    width: 320,
                },
            ],
        })
    }
}

struct Harness {
    coordinator: Arc<Coordinator>,
    worker: Arc<MutationWorker>,
    relay: Arc<EventRelay>,
    storage: Arc<MemoryQueueStorage>,
    queue: Arc<SqliteActionQueue>,
    events: Arc<SqliteEventLog>,
    tokens: TokenManager,
}

/// Acks fail while `fail_ack` is set, after which it clears itself
struct FlakyAckQueue {
    inner: Arc<SqliteActionQueue>,
    fail_ack: AtomicBool,
}

#[async_trait]
impl ActionQueue for FlakyAckQueue {
    async fn enqueue(&self, action: &PendingAction) -> Result<()> {
        self.inner.enqueue(action).await
    }

    async fn claim(&self) -> Result<Option<Delivery>> {
        self.inner.claim().await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        if self.fail_ack.swap(false, Ordering::SeqCst) {
            return Err(JukeboxError::PipelineError("ack lost".to_string()));
        }
        self.inner.ack(delivery).await
    }

    async fn retry(&self, delivery: &Delivery, delay: Duration) -> Result<()> {
        self.inner.retry(delivery, delay).await
    }

    async fn pending_count(&self) -> Result<usize> {
        self.inner.pending_count().await
    }
}

struct Client {
    conn: Connection,
    rx: mpsc::Receiver<Message>,
}

impl Client {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(256);
        Self {
            conn: Connection::new(tx),
            rx,
        }
    }

    fn id(&self) -> &str {
        &self.conn.id
    }

    async fn next_event(&mut self) -> Value {
        let msg = timeout(Duration::from_secs(2), self.rx.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("connection queue closed");
        serde_json::from_str(msg.to_str().unwrap()).unwrap()
    }

    async fn expect(&mut self, event_type: &str) -> Value {
        let event = self.next_event().await;
        assert_eq!(event["type"], event_type, "unexpected event {}", event);
        event
    }

    async fn expect_error(&mut self, message: &str) {
        let event = self.expect("error").await;
        assert_eq!(event["data"]["message"], message);
    }

    async fn assert_quiet(&mut self) {
        sleep(Duration::from_millis(50)).await;
        if let Ok(msg) = self.rx.try_recv() {
            panic!("unexpected event {:?}", msg.to_str());
        }
    }
}

fn fast_pipeline(max_attempts: u32, lease: Duration) -> PipelineConfig {
    PipelineConfig {
        node_id: NODE.to_string(),
        lease,
        max_attempts,
        poll_interval: Duration::from_millis(10),
    }
}

async fn harness_with(policy: RoomPolicy, pipeline: PipelineConfig) -> Harness {
    let pool = storage::connect("sqlite::memory:").await.unwrap();
    Harness::node(pool, Arc::new(MemoryQueueStorage::new()), policy, pipeline).await
}

async fn harness() -> Harness {
    harness_with(
        RoomPolicy::default(),
        fast_pipeline(3, Duration::from_secs(30)),
    )
    .await
}

impl Harness {
    /// One server process on a shared store
    async fn node(
        pool: SqlitePool,
        storage: Arc<MemoryQueueStorage>,
        policy: RoomPolicy,
        pipeline: PipelineConfig,
    ) -> Harness {
        let queue = Arc::new(SqliteActionQueue::new(pool.clone(), pipeline.lease));
        queue.migrate().await.unwrap();
        let events = Arc::new(SqliteEventLog::new(pool));
        events.migrate().await.unwrap();

        let coordinator = Arc::new(Coordinator::new(
            TokenManager::new(SECRET),
            storage.clone(),
            queue.clone(),
            policy,
            pipeline.node_id.clone(),
            64,
        ));
        let poll_interval = pipeline.poll_interval;
        let worker = Arc::new(MutationWorker::new(
            storage.clone(),
            Arc::new(StubLookup),
            queue.clone(),
            events.clone(),
            pipeline,
            coordinator.wake_handle(),
        ));
        let relay = Arc::new(
            EventRelay::new(events.clone(), coordinator.clone(), poll_interval)
                .await
                .unwrap(),
        );

        Harness {
            coordinator,
            worker,
            relay,
            storage,
            queue,
            events,
            tokens: TokenManager::new(SECRET),
        }
    }

    fn token(&self, user: &str, creator: &str) -> String {
        self.tokens
            .issue_join_token(&JoinClaims::new(user, creator))
            .unwrap()
    }

    async fn join(&self, client: &mut Client, user: &str, creator: &str) -> Value {
        self.coordinator
            .join_room(&client.conn, &self.token(user, creator), SPACE)
            .await
            .unwrap();
        client.expect(&format!("joined/{}", SPACE)).await
    }

    async fn add(&self, client: &Client, url: &str) -> Result<()> {
        self.coordinator
            .add_to_queue(client.id(), SPACE, None, url)
            .await
    }

    /// Apply everything deliverable, then relay the results to this node's
    /// connections
    async fn drain(&self) -> usize {
        let handled = self.worker.drain().await.unwrap();
        self.relay.pump().await.unwrap();
        handled
    }

    /// Unplayed item ids in submission order
    async fn unplayed_ids(&self) -> Vec<String> {
        self.storage
            .unplayed_entries(SPACE)
            .await
            .unwrap()
            .into_iter()
            .map(|entry| entry.item.id)
            .collect()
    }
}

fn link(n: usize) -> String {
    format!("https://youtu.be/{:0>11}", n)
}

#[tokio::test]
async fn test_first_join_binds_host_and_rejects_other_claims() {
    let h = harness().await;
    let mut host = Client::new();
    let mut alice = Client::new();
    let mut mallory = Client::new();

    let joined = h.join(&mut host, "host", "host").await;
    assert_eq!(joined["data"]["isHost"], true);
    let joined = h.join(&mut alice, "alice", "host").await;
    assert_eq!(joined["data"]["isHost"], false);

    let result = h
        .coordinator
        .join_room(&mallory.conn, &h.token("mallory", "mallory"), SPACE)
        .await;
    assert!(matches!(result, Err(JukeboxError::Unauthorized(_))));

    assert_eq!(h.coordinator.host_of(SPACE).await.as_deref(), Some("host"));
    assert!(!h.coordinator.is_member(SPACE, "mallory").await);
    assert!(!h.coordinator.has_user("mallory").await);
    mallory.assert_quiet().await;
}

#[tokio::test]
async fn test_bad_token_leaves_connection_unjoined() {
    let h = harness().await;
    let mut client = Client::new();

    let result = h.coordinator.join_room(&client.conn, "garbage", SPACE).await;
    let err = result.unwrap_err();
    assert_eq!(err.client_message(), "Token verification failed");

    h.coordinator.report_error(&client.conn, &err).await;
    client.expect_error("Token verification failed").await;
    assert_eq!(h.coordinator.room_count().await, 0);
    assert_eq!(h.coordinator.connection_count().await, 0);
}

#[tokio::test]
async fn test_rejoin_is_single_membership() {
    let h = harness().await;
    let mut first = Client::new();
    let mut second = Client::new();

    h.join(&mut first, "alice", "host").await;
    h.join(&mut first, "alice", "host").await;
    h.join(&mut second, "alice", "host").await;

    assert_eq!(h.coordinator.member_count(SPACE).await, 1);
    assert_eq!(h.coordinator.connection_count().await, 2);
}

#[tokio::test]
async fn test_disconnect_removes_member_but_keeps_room() {
    let h = harness().await;
    let mut host = Client::new();
    let mut alice = Client::new();
    h.join(&mut host, "host", "host").await;
    h.join(&mut alice, "alice", "host").await;

    h.coordinator.disconnect(alice.id()).await;

    assert!(!h.coordinator.is_member(SPACE, "alice").await);
    assert!(!h.coordinator.has_user("alice").await);
    assert!(h.coordinator.has_room(SPACE).await);
    assert_eq!(h.coordinator.member_count(SPACE).await, 1);
}

#[tokio::test]
async fn test_user_stays_while_another_connection_is_bound() {
    let h = harness().await;
    let mut phone = Client::new();
    let mut laptop = Client::new();
    h.join(&mut phone, "alice", "host").await;
    h.join(&mut laptop, "alice", "host").await;

    h.coordinator.disconnect(phone.id()).await;
    assert!(h.coordinator.is_member(SPACE, "alice").await);

    h.coordinator.disconnect(laptop.id()).await;
    assert!(!h.coordinator.is_member(SPACE, "alice").await);
}

#[tokio::test]
async fn test_vote_cooldown_window() {
    let policy = RoomPolicy {
        vote_cooldown: Duration::from_millis(200),
        ..RoomPolicy::default()
    };
    let h = harness_with(policy, fast_pipeline(3, Duration::from_secs(30))).await;
    let mut host = Client::new();
    let mut alice = Client::new();
    h.join(&mut host, "host", "host").await;
    h.join(&mut alice, "alice", "host").await;

    h.add(&host, &link(1)).await.unwrap();
    h.drain().await;
    let stream_id = h.unplayed_ids().await[0].clone();

    h.coordinator
        .cast_vote(alice.id(), SPACE, Some("alice"), &stream_id, VoteDirection::Upvote)
        .await
        .unwrap();
    let denied = h
        .coordinator
        .cast_vote(alice.id(), SPACE, Some("alice"), &stream_id, VoteDirection::Downvote)
        .await;
    assert!(matches!(denied, Err(JukeboxError::RateLimited(_))));

    sleep(Duration::from_millis(250)).await;
    h.coordinator
        .cast_vote(alice.id(), SPACE, Some("alice"), &stream_id, VoteDirection::Downvote)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_vote_cooldown_message_and_host_exemption() {
    let h = harness().await;
    let mut host = Client::new();
    let mut alice = Client::new();
    h.join(&mut host, "host", "host").await;
    h.join(&mut alice, "alice", "host").await;
    h.add(&host, &link(1)).await.unwrap();
    h.add(&host, &link(2)).await.unwrap();
    h.drain().await;
    let ids = h.unplayed_ids().await;

    h.coordinator
        .cast_vote(alice.id(), SPACE, None, &ids[0], VoteDirection::Upvote)
        .await
        .unwrap();
    let err = h
        .coordinator
        .cast_vote(alice.id(), SPACE, None, &ids[1], VoteDirection::Upvote)
        .await
        .unwrap_err();
    assert_eq!(err.client_message(), "You can vote after 20 mins");

    for id in &ids {
        h.coordinator
            .cast_vote(host.id(), SPACE, None, id, VoteDirection::Upvote)
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_queue_capacity_applies_to_members_only() {
    let h = harness().await;
    let mut host = Client::new();
    let mut alice = Client::new();
    h.join(&mut host, "host", "host").await;
    h.join(&mut alice, "alice", "host").await;

    for n in 0..20 {
        h.add(&host, &link(n)).await.unwrap();
    }
    assert_eq!(h.drain().await, 20);

    let denied = h.add(&alice, &link(100)).await;
    assert!(matches!(denied, Err(JukeboxError::QueueFull)));
    h.add(&host, &link(101)).await.unwrap();
    h.drain().await;
    assert_eq!(h.storage.count_unplayed(SPACE).await.unwrap(), 21);

    // The denial stamped no cooldown
    h.coordinator
        .empty_queue(host.id(), SPACE, None)
        .await
        .unwrap();
    h.drain().await;
    h.add(&alice, &link(100)).await.unwrap();
}

#[tokio::test]
async fn test_submission_checks_run_in_order() {
    let h = harness().await;
    let mut host = Client::new();
    let mut alice = Client::new();
    let mut bob = Client::new();
    h.join(&mut host, "host", "host").await;
    h.join(&mut alice, "alice", "host").await;
    h.join(&mut bob, "bob", "host").await;

    let err = h.add(&alice, "https://vimeo.com/1234").await.unwrap_err();
    assert_eq!(err.client_message(), "Invalid YouTube URL");

    h.add(&alice, &link(7)).await.unwrap();

    let err = h.add(&alice, &link(8)).await.unwrap_err();
    assert_eq!(err.client_message(), "You can add again after 20 min.");

    // Blocklist is checked before bob's (empty) cooldown
    let err = h.add(&bob, &link(7)).await.unwrap_err();
    assert_eq!(err.client_message(), "This song is blocked for 1 hour");

    h.add(&host, &link(7)).await.unwrap();
    assert_eq!(h.drain().await, 2);
}

#[tokio::test]
async fn test_new_stream_event_payload() {
    let h = harness().await;
    let mut host = Client::new();
    let mut alice = Client::new();
    h.join(&mut host, "host", "host").await;
    h.join(&mut alice, "alice", "host").await;

    h.add(&host, &link(1)).await.unwrap();
    h.add(&alice, &link(2)).await.unwrap();
    h.drain().await;

    let first = host.expect(&format!("new-stream/{}", SPACE)).await;
    assert_eq!(first["data"]["queuePosition"], 1);
    let second = host.expect(&format!("new-stream/{}", SPACE)).await;
    let data = &second["data"];
    assert_eq!(data["queuePosition"], 2);
    assert_eq!(data["addedBy"], "alice");
    assert_eq!(data["userId"], "host");
    assert_eq!(data["spaceId"], SPACE);
    assert_eq!(data["extractedId"], "00000000002");
    assert_eq!(data["title"], "Video 00000000002");
    assert_eq!(data["smallImg"], "https://img.example/small.jpg");
    assert_eq!(data["bigImg"], "https://img.example/large.jpg");
    assert_eq!(data["upvotes"], 0);
    assert_eq!(data["hasUpvoted"], false);
    assert_eq!(data["played"], false);

    // Members see the same broadcast
    alice.expect(&format!("new-stream/{}", SPACE)).await;
}

#[tokio::test]
async fn test_unknown_video_is_reported_to_submitter() {
    let h = harness().await;
    let mut host = Client::new();
    let mut alice = Client::new();
    h.join(&mut host, "host", "host").await;
    h.join(&mut alice, "alice", "host").await;

    h.add(&alice, "https://www.youtube.com/watch?v=missing0000")
        .await
        .unwrap();
    h.drain().await;

    alice.expect_error("Video not found").await;
    host.assert_quiet().await;
    assert_eq!(h.storage.item_count().await, 0);
}

#[tokio::test]
async fn test_empty_queue_emits_one_event_for_any_size() {
    for size in [0usize, 1, 20] {
        let h = harness().await;
        let mut host = Client::new();
        let mut listener = Client::new();
        h.join(&mut host, "host", "host").await;
        h.join(&mut listener, "listener", "host").await;

        for n in 0..size {
            h.add(&host, &link(n)).await.unwrap();
        }
        h.drain().await;
        for _ in 0..size {
            listener.expect(&format!("new-stream/{}", SPACE)).await;
        }

        h.coordinator
            .empty_queue(host.id(), SPACE, None)
            .await
            .unwrap();
        h.drain().await;

        listener.expect(&format!("empty-queue/{}", SPACE)).await;
        listener.assert_quiet().await;
        assert_eq!(h.storage.count_unplayed(SPACE).await.unwrap(), 0, "size {}", size);
    }
}

#[tokio::test]
async fn test_play_next_on_empty_queue() {
    let h = harness().await;
    let mut host = Client::new();
    let mut listener = Client::new();
    h.join(&mut host, "host", "host").await;
    h.join(&mut listener, "listener", "host").await;

    h.coordinator
        .play_next(host.id(), SPACE, Some("host"))
        .await
        .unwrap();
    h.drain().await;

    host.expect_error("Please add video in queue").await;
    listener.assert_quiet().await;
    assert!(h.storage.get_current(SPACE).await.unwrap().is_none());
}

#[tokio::test]
async fn test_play_next_tie_goes_to_earliest_submission() {
    let h = harness().await;
    let mut host = Client::new();
    h.join(&mut host, "host", "host").await;

    h.add(&host, &link(1)).await.unwrap();
    h.add(&host, &link(2)).await.unwrap();
    h.drain().await;
    let ids = h.unplayed_ids().await;
    let (a, b) = (ids[0].clone(), ids[1].clone());

    let mut voters = Vec::new();
    // Later submission gets its votes first
    for n in 0..6 {
        let mut voter = Client::new();
        h.join(&mut voter, &format!("voter-{}", n), "host").await;
        let id = if n < 3 { &b } else { &a };
        h.coordinator
            .cast_vote(voter.id(), SPACE, None, id, VoteDirection::Upvote)
            .await
            .unwrap();
        voters.push(voter);
    }
    h.drain().await;
    assert_eq!(h.storage.count_votes(&a).await.unwrap(), 3);
    assert_eq!(h.storage.count_votes(&b).await.unwrap(), 3);

    h.coordinator
        .play_next(host.id(), SPACE, None)
        .await
        .unwrap();
    h.drain().await;

    let current = h.storage.get_current(SPACE).await.unwrap().unwrap();
    assert_eq!(current.item_id, a);
    assert_eq!(h.unplayed_ids().await, vec![b]);
}

#[tokio::test]
async fn test_votes_and_downvote_without_vote() {
    let h = harness().await;
    let mut host = Client::new();
    let mut alice = Client::new();
    h.join(&mut host, "host", "host").await;
    h.join(&mut alice, "alice", "host").await;
    h.add(&host, &link(1)).await.unwrap();
    h.drain().await;
    alice.expect(&format!("new-stream/{}", SPACE)).await;
    let id = h.unplayed_ids().await[0].clone();

    // Nothing to remove: accepted, applied as a no-op, not broadcast
    h.coordinator
        .cast_vote(host.id(), SPACE, None, &id, VoteDirection::Downvote)
        .await
        .unwrap();
    h.drain().await;
    alice.assert_quiet().await;

    h.coordinator
        .cast_vote(host.id(), SPACE, None, &id, VoteDirection::Upvote)
        .await
        .unwrap();
    h.drain().await;
    let vote = alice.expect(&format!("new-vote/{}", SPACE)).await;
    assert_eq!(vote["data"]["vote"], "upvote");
    assert_eq!(vote["data"]["streamId"], id.as_str());
    assert_eq!(vote["data"]["votedBy"], "host");
    host.expect(&format!("new-stream/{}", SPACE)).await;
    host.expect(&format!("new-vote/{}", SPACE)).await;

    // A second upvote conflicts with the stored one
    h.coordinator
        .cast_vote(host.id(), SPACE, None, &id, VoteDirection::Upvote)
        .await
        .unwrap();
    h.drain().await;
    host.expect_error("You have already voted for this song").await;
    assert_eq!(h.storage.count_votes(&id).await.unwrap(), 1);
}

#[tokio::test]
async fn test_host_only_actions() {
    let h = harness().await;
    let mut host = Client::new();
    let mut alice = Client::new();
    h.join(&mut host, "host", "host").await;
    h.join(&mut alice, "alice", "host").await;

    let err = h
        .coordinator
        .play_next(alice.id(), SPACE, None)
        .await
        .unwrap_err();
    assert_eq!(err.client_message(), "You can't perform this action.");
    let err = h
        .coordinator
        .remove_song(alice.id(), SPACE, None, "whatever")
        .await
        .unwrap_err();
    assert_eq!(err.client_message(), "You cant remove the song . You are not the host");
    let err = h
        .coordinator
        .empty_queue(alice.id(), SPACE, None)
        .await
        .unwrap_err();
    assert!(matches!(err, JukeboxError::PermissionDenied(_)));

    assert_eq!(h.queue.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_remove_song() {
    let h = harness().await;
    let mut host = Client::new();
    let mut listener = Client::new();
    h.join(&mut host, "host", "host").await;
    h.join(&mut listener, "listener", "host").await;
    h.add(&host, &link(1)).await.unwrap();
    h.drain().await;
    listener.expect(&format!("new-stream/{}", SPACE)).await;
    host.expect(&format!("new-stream/{}", SPACE)).await;
    let id = h.unplayed_ids().await[0].clone();

    // Unknown ids are tolerated without an event
    h.coordinator
        .remove_song(host.id(), SPACE, None, "no-such-song")
        .await
        .unwrap();
    h.drain().await;
    listener.assert_quiet().await;
    host.assert_quiet().await;

    h.coordinator
        .remove_song(host.id(), SPACE, None, &id)
        .await
        .unwrap();
    h.drain().await;
    let event = listener.expect(&format!("remove-song/{}", SPACE)).await;
    assert_eq!(event["data"]["streamId"], id.as_str());
    assert!(h.storage.get_item(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_acting_identity_comes_from_connection() {
    let h = harness().await;
    let mut alice = Client::new();
    let stranger = Client::new();
    h.join(&mut alice, "alice", "host").await;

    let err = h
        .coordinator
        .add_to_queue(alice.id(), SPACE, Some("host"), &link(1))
        .await
        .unwrap_err();
    assert!(matches!(err, JukeboxError::Unauthorized(_)));

    let err = h
        .coordinator
        .add_to_queue(stranger.id(), SPACE, None, &link(1))
        .await
        .unwrap_err();
    assert!(matches!(err, JukeboxError::Unauthorized(_)));

    let err = h
        .coordinator
        .add_to_queue(alice.id(), "another-space", None, &link(1))
        .await
        .unwrap_err();
    assert!(matches!(err, JukeboxError::Unauthorized(_)));
}

#[tokio::test]
async fn test_errors_reach_every_connection_of_the_user() {
    let h = harness().await;
    let mut phone = Client::new();
    let mut laptop = Client::new();
    h.join(&mut phone, "alice", "host").await;
    h.join(&mut laptop, "alice", "host").await;

    h.coordinator
        .report_error(&phone.conn, &JukeboxError::QueueFull)
        .await;
    phone.expect_error("Queue limit reached").await;
    laptop.expect_error("Queue limit reached").await;
}

#[tokio::test]
async fn test_storage_outage_denies_without_cooldown() {
    let h = harness().await;
    let mut alice = Client::new();
    h.join(&mut alice, "alice", "host").await;

    h.storage.set_unavailable(true);
    let err = h.add(&alice, &link(1)).await.unwrap_err();
    assert!(err.is_transient());
    h.storage.set_unavailable(false);

    h.add(&alice, &link(1)).await.unwrap();
}

#[tokio::test]
async fn test_transient_failure_is_retried_before_broadcast() {
    let h = harness().await;
    let mut host = Client::new();
    h.join(&mut host, "host", "host").await;
    h.add(&host, &link(1)).await.unwrap();

    h.storage.set_unavailable(true);
    assert!(h.worker.process_next().await.unwrap());
    host.assert_quiet().await;
    assert_eq!(h.queue.pending_count().await.unwrap(), 1);

    h.storage.set_unavailable(false);
    sleep(Duration::from_millis(300)).await;
    assert_eq!(h.drain().await, 1);
    host.expect(&format!("new-stream/{}", SPACE)).await;
    host.assert_quiet().await;
}

#[tokio::test]
async fn test_exhausted_retries_are_reported() {
    let h = harness_with(
        RoomPolicy::default(),
        fast_pipeline(1, Duration::from_secs(30)),
    )
    .await;
    let mut host = Client::new();
    h.join(&mut host, "host", "host").await;
    h.add(&host, &link(1)).await.unwrap();

    h.storage.set_unavailable(true);
    h.drain().await;
    h.storage.set_unavailable(false);

    host.expect_error("Something went wrong, please try again").await;
    assert_eq!(h.queue.pending_count().await.unwrap(), 0);
    assert_eq!(h.storage.item_count().await, 0);
}

#[tokio::test]
async fn test_redelivered_add_creates_one_item() {
    let h = harness_with(RoomPolicy::default(), fast_pipeline(3, Duration::ZERO)).await;
    let mut host = Client::new();
    h.join(&mut host, "host", "host").await;
    h.add(&host, &link(1)).await.unwrap();

    // A first attempt that wrote the item and died before acking
    let delivery = h.queue.claim().await.unwrap().unwrap();
    h.storage
        .create_item(NewQueueItem {
            id: delivery.action.id.to_string(),
            room_id: SPACE.to_string(),
            owner_id: "host".to_string(),
            added_by: "host".to_string(),
            url: link(1),
            media_id: "00000000001".to_string(),
            title: "Video 00000000001".to_string(),
            small_img: "s".to_string(),
            big_img: "b".to_string(),
            created_at: delivery.action.enqueued_at,
        })
        .await
        .unwrap();

    sleep(Duration::from_millis(5)).await;
    assert_eq!(h.drain().await, 1);
    assert_eq!(h.storage.item_count().await, 1);
    let event = host.expect(&format!("new-stream/{}", SPACE)).await;
    assert_eq!(event["data"]["id"], delivery.action.id.to_string());
}

#[tokio::test]
async fn test_redelivered_play_next_does_not_skip() {
    let h = harness_with(RoomPolicy::default(), fast_pipeline(3, Duration::ZERO)).await;
    let mut host = Client::new();
    h.join(&mut host, "host", "host").await;
    h.add(&host, &link(1)).await.unwrap();
    h.add(&host, &link(2)).await.unwrap();
    h.drain().await;
    let ids = h.unplayed_ids().await;

    h.coordinator
        .play_next(host.id(), SPACE, None)
        .await
        .unwrap();
    // A first attempt that recorded the current item and died
    let delivery = h.queue.claim().await.unwrap().unwrap();
    h.storage
        .upsert_current(CurrentItem {
            room_id: SPACE.to_string(),
            item_id: ids[0].clone(),
            user_id: "host".to_string(),
            action_id: delivery.action.id.to_string(),
        })
        .await
        .unwrap();

    sleep(Duration::from_millis(5)).await;
    assert_eq!(h.drain().await, 1);

    assert_eq!(h.unplayed_ids().await, vec![ids[1].clone()]);
    let current = h.storage.get_current(SPACE).await.unwrap().unwrap();
    assert_eq!(current.item_id, ids[0]);
}

#[tokio::test]
async fn test_idle_room_eviction_allows_new_host() {
    let h = harness().await;
    let mut host = Client::new();
    h.join(&mut host, "host", "host").await;
    h.coordinator.disconnect(host.id()).await;

    let evicted = h.coordinator.sweep_idle_rooms(Duration::ZERO).await;
    assert_eq!(evicted, vec![SPACE.to_string()]);
    assert!(!h.coordinator.has_room(SPACE).await);

    let mut newcomer = Client::new();
    let joined = h.join(&mut newcomer, "newcomer", "newcomer").await;
    assert_eq!(joined["data"]["isHost"], true);
}

#[tokio::test]
async fn test_two_nodes_apply_in_acceptance_order() {
    let pool = storage::connect("sqlite::memory:").await.unwrap();
    let shared = Arc::new(MemoryQueueStorage::new());
    let pipeline = |node: &str| PipelineConfig {
        node_id: node.to_string(),
        ..fast_pipeline(3, Duration::from_secs(30))
    };
    let node_a = Harness::node(
        pool.clone(),
        shared.clone(),
        RoomPolicy::default(),
        pipeline("node-a"),
    )
    .await;
    let node_b = Harness::node(pool, shared.clone(), RoomPolicy::default(), pipeline("node-b")).await;

    let mut host = Client::new();
    let mut alice = Client::new();
    node_a.join(&mut host, "host", "host").await;
    node_b.join(&mut alice, "alice", "host").await;

    // Alice's submission is accepted on B before the host empties on A
    node_b.add(&alice, &link(1)).await.unwrap();
    node_a
        .coordinator
        .empty_queue(host.id(), SPACE, None)
        .await
        .unwrap();

    // Node A's worker applies both, in the order they were accepted
    assert_eq!(node_a.drain().await, 2);
    assert_eq!(node_b.drain().await, 0);
    assert_eq!(shared.count_unplayed(SPACE).await.unwrap(), 0);
    assert_eq!(shared.item_count().await, 1);

    for client in [&mut host, &mut alice] {
        let added = client.expect(&format!("new-stream/{}", SPACE)).await;
        assert_eq!(added["data"]["addedBy"], "alice");
        client.expect(&format!("empty-queue/{}", SPACE)).await;
        client.assert_quiet().await;
    }
}

#[tokio::test]
async fn test_rejection_reaches_issuer_on_another_node() {
    let pool = storage::connect("sqlite::memory:").await.unwrap();
    let shared = Arc::new(MemoryQueueStorage::new());
    let pipeline = fast_pipeline(3, Duration::from_secs(30));
    let node_a = Harness::node(
        pool.clone(),
        shared.clone(),
        RoomPolicy::default(),
        pipeline.clone(),
    )
    .await;
    let node_b = Harness::node(pool, shared, RoomPolicy::default(), pipeline).await;

    let mut host = Client::new();
    let mut alice = Client::new();
    node_a.join(&mut host, "host", "host").await;
    node_b.join(&mut alice, "alice", "host").await;

    node_b
        .add(&alice, "https://www.youtube.com/watch?v=missing0000")
        .await
        .unwrap();
    node_a.drain().await;
    node_b.drain().await;

    alice.expect_error("Video not found").await;
    host.assert_quiet().await;
}

#[tokio::test]
async fn test_lost_ack_announces_once() {
    let h = harness().await;
    let mut host = Client::new();
    h.join(&mut host, "host", "host").await;
    h.add(&host, &link(1)).await.unwrap();

    let flaky = Arc::new(FlakyAckQueue {
        inner: h.queue.clone(),
        fail_ack: AtomicBool::new(true),
    });
    let worker = MutationWorker::new(
        h.storage.clone(),
        Arc::new(StubLookup),
        flaky,
        h.events.clone(),
        fast_pipeline(3, Duration::from_secs(30)),
        h.coordinator.wake_handle(),
    );

    // Applied and announced, but the ack never landed
    assert!(worker.process_next().await.unwrap());
    assert_eq!(h.queue.pending_count().await.unwrap(), 1);
    h.relay.pump().await.unwrap();
    host.expect(&format!("new-stream/{}", SPACE)).await;

    sleep(Duration::from_millis(300)).await;
    assert_eq!(h.drain().await, 1);
    assert_eq!(h.queue.pending_count().await.unwrap(), 0);
    assert_eq!(h.storage.item_count().await, 1);
    host.assert_quiet().await;
}

#[tokio::test]
async fn test_pay_and_play_next_takes_over_playback() {
    let h = harness().await;
    let mut host = Client::new();
    let mut alice = Client::new();
    h.join(&mut host, "host", "host").await;
    h.join(&mut alice, "alice", "host").await;
    h.add(&host, &link(1)).await.unwrap();
    h.drain().await;
    let queued = h.unplayed_ids().await;
    host.expect(&format!("new-stream/{}", SPACE)).await;
    alice.expect(&format!("new-stream/{}", SPACE)).await;

    // Members may use it, even while their submission cooldown runs
    h.add(&alice, &link(2)).await.unwrap();
    h.coordinator
        .pay_and_play_next(alice.id(), SPACE, Some("alice"), &link(3))
        .await
        .unwrap();
    h.drain().await;

    let current = h.storage.get_current(SPACE).await.unwrap().unwrap();
    assert_eq!(current.user_id, "alice");
    let item = h.storage.get_item(&current.item_id).await.unwrap().unwrap();
    assert_eq!(item.media_id, "00000000003");
    assert_eq!(item.added_by, "alice");
    assert_eq!(item.owner_id, "host");
    assert!(item.played);

    // Earlier submissions stay queued
    let unplayed = h.unplayed_ids().await;
    assert_eq!(unplayed.len(), 2);
    assert_eq!(unplayed[0], queued[0]);

    for client in [&mut host, &mut alice] {
        client.expect(&format!("new-stream/{}", SPACE)).await;
        client.expect(&format!("play-next/{}", SPACE)).await;
        client.assert_quiet().await;
    }
}

#[tokio::test]
async fn test_pay_and_play_next_checks_link_and_membership() {
    let h = harness().await;
    let mut alice = Client::new();
    let stranger = Client::new();
    h.join(&mut alice, "alice", "host").await;

    let err = h
        .coordinator
        .pay_and_play_next(alice.id(), SPACE, None, "https://vimeo.com/1234")
        .await
        .unwrap_err();
    assert_eq!(err.client_message(), "Invalid YouTube URL");

    let err = h
        .coordinator
        .pay_and_play_next(stranger.id(), SPACE, None, &link(1))
        .await
        .unwrap_err();
    assert!(matches!(err, JukeboxError::Unauthorized(_)));
    assert_eq!(h.queue.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_pay_and_play_next_unknown_video() {
    let h = harness().await;
    let mut host = Client::new();
    let mut alice = Client::new();
    h.join(&mut host, "host", "host").await;
    h.join(&mut alice, "alice", "host").await;

    h.coordinator
        .pay_and_play_next(alice.id(), SPACE, None, "https://youtu.be/missing0000")
        .await
        .unwrap();
    h.drain().await;

    alice.expect_error("Video not found").await;
    host.assert_quiet().await;
    assert!(h.storage.get_current(SPACE).await.unwrap().is_none());
}
