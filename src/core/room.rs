use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::core::fanout::RoomTopic;
use crate::error::{JukeboxError, Result};

/// A listening room centered on one host
#[derive(Debug)]
pub struct Room {
    /// Unique identifier for the room (the space id)
    pub id: String,
    /// Host bound by the first verified join
    pub host_id: Option<String>,
    /// User ids currently in the room
    pub members: HashSet<String>,
    /// Broadcast topic every joined connection subscribes to
    pub topic: RoomTopic,
    /// Timestamp of room creation
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// When the room last became empty
    pub empty_since: Option<Instant>,
}

impl Room {
    pub fn new(id: String, topic_capacity: usize) -> Self {
        Self {
            id,
            host_id: None,
            members: HashSet::new(),
            topic: RoomTopic::new(topic_capacity),
            created_at: chrono::Utc::now(),
            empty_since: Some(Instant::now()),
        }
    }

    /// Bind the host on first claim; later claims must name the same host
    pub fn claim_host(&mut self, host_id: &str) -> Result<()> {
        match &self.host_id {
            None => {
                self.host_id = Some(host_id.to_string());
                Ok(())
            }
            Some(current) if current == host_id => Ok(()),
            Some(current) => {
                log::warn!(
                    "Rejected join claim for room {}: host {} does not match bound host {}",
                    self.id,
                    host_id,
                    current
                );
                Err(JukeboxError::Unauthorized(
                    "Join claim does not match this room's host".to_string(),
                ))
            }
        }
    }

    /// Adds a member; returns false if already present
    pub fn add_member(&mut self, user_id: &str) -> bool {
        self.empty_since = None;
        self.members.insert(user_id.to_string())
    }

    /// Removes a member from the room
    pub fn remove_member(&mut self, user_id: &str) -> bool {
        let removed = self.members.remove(user_id);
        if removed && self.members.is_empty() {
            self.empty_since = Some(Instant::now());
        }
        removed
    }

    pub fn has_member(&self, user_id: &str) -> bool {
        self.members.contains(user_id)
    }

    pub fn is_host(&self, user_id: &str) -> bool {
        self.host_id.as_deref() == Some(user_id)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }
}

/// Manages all rooms held by this process
pub struct RoomManager {
    rooms: HashMap<String, Room>,
    topic_capacity: usize,
}

impl RoomManager {
    pub fn new(topic_capacity: usize) -> Self {
        Self {
            rooms: HashMap::new(),
            topic_capacity,
        }
    }

    /// Returns the room, creating it without a host if absent
    pub fn ensure_room(&mut self, room_id: &str) -> &mut Room {
        let capacity = self.topic_capacity;
        self.rooms.entry(room_id.to_string()).or_insert_with(|| {
            log::info!("Creating room {}", room_id);
            Room::new(room_id.to_string(), capacity)
        })
    }

    /// Adds a user to a room under a verified host claim. Joining twice is a
    /// no-op on membership. A rejected claim leaves the room untouched.
    pub fn join(&mut self, room_id: &str, host_id: &str, user_id: &str) -> Result<&Room> {
        let room = self.ensure_room(room_id);
        room.claim_host(host_id)?;
        if room.add_member(user_id) {
            log::debug!("User {} joined room {}", user_id, room_id);
        }
        Ok(room)
    }

    /// Removes a member; the room itself is kept
    pub fn leave(&mut self, room_id: &str, user_id: &str) -> bool {
        match self.rooms.get_mut(room_id) {
            Some(room) => room.remove_member(user_id),
            None => false,
        }
    }

    pub fn is_host(&self, room_id: &str, user_id: &str) -> bool {
        self.rooms
            .get(room_id)
            .map(|room| room.is_host(user_id))
            .unwrap_or(false)
    }

    pub fn is_member(&self, room_id: &str, user_id: &str) -> bool {
        self.rooms
            .get(room_id)
            .map(|room| room.has_member(user_id))
            .unwrap_or(false)
    }

    pub fn get(&self, room_id: &str) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    pub fn host_of(&self, room_id: &str) -> Option<&str> {
        self.rooms.get(room_id).and_then(|room| room.host_id.as_deref())
    }

    /// Gets all members of a room
    pub fn members(&self, room_id: &str) -> Result<Vec<String>> {
        let room = self
            .rooms
            .get(room_id)
            .ok_or_else(|| JukeboxError::NotFound(format!("Room {} not found", room_id)))?;
        Ok(room.members.iter().cloned().collect())
    }

    /// Publish a serialized event to every connection subscribed to the room
    pub fn publish(&self, room_id: &str, payload: &str) -> usize {
        self.rooms
            .get(room_id)
            .map(|room| room.topic.publish(payload))
            .unwrap_or(0)
    }

    /// Drop rooms that have been empty for longer than `grace`; returns their ids
    pub fn evict_idle(&mut self, grace: Duration) -> Vec<String> {
        let expired: Vec<String> = self
            .rooms
            .values()
            .filter(|room| {
                room.members.is_empty()
                    && room
                        .empty_since
                        .map(|since| since.elapsed() >= grace)
                        .unwrap_or(false)
            })
            .map(|room| room.id.clone())
            .collect();

        for room_id in &expired {
            self.rooms.remove(room_id);
            log::info!("Evicted idle room {}", room_id);
        }
        expired
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
