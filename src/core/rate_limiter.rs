//! Per-room limits for non-host members: vote and submission cooldowns,
//! a short-lived link blocklist and the queue capacity gate.
//!
//! State lives only in the process that owns the room. Losing it on restart
//! is fine since it only throttles and never authorizes.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::RoomPolicy;
use crate::error::{JukeboxError, Result};

/// Actions gated by a cooldown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Vote,
    Submission,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Denied { remaining: Duration },
}

/// Decide a cooldown from the last accepted timestamp alone. The action is
/// allowed once the time since the last one exceeds the window.
pub fn cooldown_decision(last: Option<Instant>, window: Duration, now: Instant) -> RateDecision {
    match last {
        None => RateDecision::Allowed,
        Some(last) => {
            let elapsed = now.saturating_duration_since(last);
            if elapsed > window {
                RateDecision::Allowed
            } else {
                RateDecision::Denied {
                    remaining: window - elapsed,
                }
            }
        }
    }
}

/// Whether a room with `unplayed` items can take another submission
pub fn has_capacity(unplayed: usize, max_queue_length: usize) -> bool {
    unplayed < max_queue_length
}

/// room -> user -> action -> last accepted time
#[derive(Debug, Default)]
pub struct CooldownLedger {
    entries: HashMap<String, HashMap<String, HashMap<ActionKind, Instant>>>,
}

impl CooldownLedger {
    pub fn last(&self, room_id: &str, user_id: &str, kind: ActionKind) -> Option<Instant> {
        self.entries
            .get(room_id)
            .and_then(|users| users.get(user_id))
            .and_then(|actions| actions.get(&kind))
            .copied()
    }

    pub fn check(
        &self,
        room_id: &str,
        user_id: &str,
        kind: ActionKind,
        window: Duration,
        now: Instant,
    ) -> RateDecision {
        cooldown_decision(self.last(room_id, user_id, kind), window, now)
    }

    /// Stamp the action; returns the previous stamp for rollback
    pub fn record(
        &mut self,
        room_id: &str,
        user_id: &str,
        kind: ActionKind,
        now: Instant,
    ) -> Option<Instant> {
        self.entries
            .entry(room_id.to_string())
            .or_default()
            .entry(user_id.to_string())
            .or_default()
            .insert(kind, now)
    }

    fn restore(&mut self, room_id: &str, user_id: &str, kind: ActionKind, previous: Option<Instant>) {
        let Some(actions) = self
            .entries
            .get_mut(room_id)
            .and_then(|users| users.get_mut(user_id))
        else {
            return;
        };
        match previous {
            Some(at) => {
                actions.insert(kind, at);
            }
            None => {
                actions.remove(&kind);
            }
        }
    }

    pub fn forget_room(&mut self, room_id: &str) {
        self.entries.remove(room_id);
    }
}

/// room -> link -> time it was blocked
#[derive(Debug, Default)]
pub struct Blocklist {
    rooms: HashMap<String, HashMap<String, Instant>>,
}

impl Blocklist {
    pub fn is_blocked(&self, room_id: &str, url: &str, ttl: Duration, now: Instant) -> bool {
        self.rooms
            .get(room_id)
            .and_then(|urls| urls.get(url))
            .map(|blocked_at| now.saturating_duration_since(*blocked_at) < ttl)
            .unwrap_or(false)
    }

    pub fn block(&mut self, room_id: &str, url: &str, now: Instant) -> Option<Instant> {
        self.rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(url.to_string(), now)
    }

    fn restore(&mut self, room_id: &str, url: &str, previous: Option<Instant>) {
        let Some(urls) = self.rooms.get_mut(room_id) else {
            return;
        };
        match previous {
            Some(at) => {
                urls.insert(url.to_string(), at);
            }
            None => {
                urls.remove(url);
            }
        }
    }

    /// Drop expired entries; returns how many were removed
    pub fn prune(&mut self, ttl: Duration, now: Instant) -> usize {
        let mut removed = 0;
        self.rooms.retain(|_, urls| {
            let before = urls.len();
            urls.retain(|_, blocked_at| now.saturating_duration_since(*blocked_at) < ttl);
            removed += before - urls.len();
            !urls.is_empty()
        });
        removed
    }

    pub fn forget_room(&mut self, room_id: &str) {
        self.rooms.remove(room_id);
    }
}

/// Ledger writes made when an action was accepted, kept so they can be
/// undone if the action never reaches the pipeline.
#[derive(Debug, Default)]
#[must_use]
pub struct Reservation {
    cooldown: Option<(String, String, ActionKind, Option<Instant>)>,
    blocked: Option<(String, String, Option<Instant>)>,
}

impl Reservation {
    /// Host actions reserve nothing
    pub fn exempt() -> Self {
        Self::default()
    }

    pub fn is_exempt(&self) -> bool {
        self.cooldown.is_none() && self.blocked.is_none()
    }
}

pub struct RateLimiter {
    policy: RoomPolicy,
    ledger: CooldownLedger,
    blocklist: Blocklist,
}

impl RateLimiter {
    pub fn new(policy: RoomPolicy) -> Self {
        Self {
            policy,
            ledger: CooldownLedger::default(),
            blocklist: Blocklist::default(),
        }
    }

    /// Gate a vote. On success the cooldown is already stamped.
    pub fn reserve_vote(
        &mut self,
        room_id: &str,
        user_id: &str,
        is_host: bool,
        now: Instant,
    ) -> Result<Reservation> {
        if is_host {
            return Ok(Reservation::exempt());
        }

        let window = self.policy.vote_cooldown;
        if let RateDecision::Denied { remaining } =
            self.ledger.check(room_id, user_id, ActionKind::Vote, window, now)
        {
            log::info!(
                "Vote cooldown active for user {} in room {} ({}s left)",
                user_id,
                room_id,
                remaining.as_secs()
            );
            return Err(JukeboxError::RateLimited(format!(
                "You can vote after {} mins",
                minutes(window)
            )));
        }

        let previous = self.ledger.record(room_id, user_id, ActionKind::Vote, now);
        Ok(Reservation {
            cooldown: Some((room_id.to_string(), user_id.to_string(), ActionKind::Vote, previous)),
            blocked: None,
        })
    }

    /// Gate a submission: blocklist, then cooldown, then capacity. The first
    /// failing check decides the error. On success the cooldown is stamped
    /// and the link blocked.
    pub fn reserve_submission(
        &mut self,
        room_id: &str,
        user_id: &str,
        url: &str,
        unplayed: usize,
        is_host: bool,
        now: Instant,
    ) -> Result<Reservation> {
        if is_host {
            return Ok(Reservation::exempt());
        }

        if self
            .blocklist
            .is_blocked(room_id, url, self.policy.blocklist_ttl, now)
        {
            log::info!("Blocked link resubmitted by {} in room {}", user_id, room_id);
            return Err(JukeboxError::Blocklisted);
        }

        let window = self.policy.submit_cooldown;
        if let RateDecision::Denied { remaining } =
            self.ledger
                .check(room_id, user_id, ActionKind::Submission, window, now)
        {
            log::info!(
                "Submission cooldown active for user {} in room {} ({}s left)",
                user_id,
                room_id,
                remaining.as_secs()
            );
            return Err(JukeboxError::RateLimited(format!(
                "You can add again after {} min.",
                minutes(window)
            )));
        }

        if !has_capacity(unplayed, self.policy.max_queue_length) {
            log::info!("Queue full in room {} ({} unplayed)", room_id, unplayed);
            return Err(JukeboxError::QueueFull);
        }

        let previous = self
            .ledger
            .record(room_id, user_id, ActionKind::Submission, now);
        let previously_blocked = self.blocklist.block(room_id, url, now);
        Ok(Reservation {
            cooldown: Some((
                room_id.to_string(),
                user_id.to_string(),
                ActionKind::Submission,
                previous,
            )),
            blocked: Some((room_id.to_string(), url.to_string(), previously_blocked)),
        })
    }

    /// Undo the writes of a reservation whose action was never enqueued
    pub fn release(&mut self, reservation: Reservation) {
        if let Some((room_id, user_id, kind, previous)) = reservation.cooldown {
            self.ledger.restore(&room_id, &user_id, kind, previous);
        }
        if let Some((room_id, url, previous)) = reservation.blocked {
            self.blocklist.restore(&room_id, &url, previous);
        }
    }

    pub fn prune(&mut self, now: Instant) -> usize {
        self.blocklist.prune(self.policy.blocklist_ttl, now)
    }

    pub fn forget_room(&mut self, room_id: &str) {
        self.ledger.forget_room(room_id);
        self.blocklist.forget_room(room_id);
    }
}

fn minutes(window: Duration) -> u64 {
    (window.as_secs() + 59) / 60
}
