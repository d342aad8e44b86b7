//! Session registry: connection <-> user <-> room associations
//!
//! The registry is the only owner of a user's connection list. Every method
//! takes `&mut self`, so a caller holding the write lock applies a whole
//! connection event or nothing.

use std::collections::HashMap;

use crate::core::connection::{Connection, ConnectionId};

/// A user present in at least one room through one or more connections
#[derive(Debug, Clone)]
pub struct UserSession {
    pub user_id: String,
    pub connections: Vec<Connection>,
    pub token: String,
}

/// Identities affected by closing a connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Unregistered {
    pub user_id: Option<String>,
    pub room_id: Option<String>,
    /// True when the user's last connection went away
    pub user_removed: bool,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    users: HashMap<String, UserSession>,
    /// connection id -> owning user id
    owners: HashMap<ConnectionId, String>,
    /// connection id -> room the connection joined
    bound_rooms: HashMap<ConnectionId, String>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a user, creating the user entry if needed.
    /// Registering the same connection twice is a no-op.
    pub fn register(&mut self, user_id: &str, connection: Connection, token: &str) {
        // A connection re-authenticating as someone else leaves its old owner first
        if let Some(previous) = self.owners.get(&connection.id).cloned() {
            if previous != user_id {
                self.detach(&previous, &connection.id);
            }
        }

        let session = self
            .users
            .entry(user_id.to_string())
            .or_insert_with(|| UserSession {
                user_id: user_id.to_string(),
                connections: Vec::new(),
                token: token.to_string(),
            });
        session.token = token.to_string();

        if !session.connections.iter().any(|c| c.id == connection.id) {
            self.owners.insert(connection.id.clone(), user_id.to_string());
            session.connections.push(connection);
        }
    }

    /// Record which room a connection joined; returns the room it was bound to before
    pub fn bind_room(&mut self, connection_id: &str, room_id: &str) -> Option<String> {
        self.bound_rooms
            .insert(connection_id.to_string(), room_id.to_string())
            .filter(|previous| previous != room_id)
    }

    /// Remove a connection from whichever user holds it
    pub fn unregister(&mut self, connection_id: &str) -> Unregistered {
        let room_id = self.bound_rooms.remove(connection_id);
        let user_id = self.owners.get(connection_id).cloned();

        let user_removed = match &user_id {
            Some(user_id) => self.detach(user_id, connection_id),
            None => false,
        };

        Unregistered {
            user_id,
            room_id,
            user_removed,
        }
    }

    fn detach(&mut self, user_id: &str, connection_id: &str) -> bool {
        self.owners.remove(connection_id);
        let now_empty = match self.users.get_mut(user_id) {
            Some(session) => {
                session.connections.retain(|c| c.id != connection_id);
                session.connections.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.users.remove(user_id);
        }
        now_empty
    }

    pub fn user_for(&self, connection_id: &str) -> Option<&str> {
        self.owners.get(connection_id).map(String::as_str)
    }

    pub fn room_for(&self, connection_id: &str) -> Option<&str> {
        self.bound_rooms.get(connection_id).map(String::as_str)
    }

    /// Whether any connection of the user is still bound to the room
    pub fn user_bound_to_room(&self, user_id: &str, room_id: &str) -> bool {
        self.users
            .get(user_id)
            .map(|session| {
                session
                    .connections
                    .iter()
                    .any(|c| self.bound_rooms.get(&c.id).map(String::as_str) == Some(room_id))
            })
            .unwrap_or(false)
    }

    pub fn connections_of(&self, user_id: &str) -> Vec<Connection> {
        self.users
            .get(user_id)
            .map(|session| session.connections.clone())
            .unwrap_or_default()
    }

    pub fn get_user(&self, user_id: &str) -> Option<&UserSession> {
        self.users.get(user_id)
    }

    pub fn has_user(&self, user_id: &str) -> bool {
        self.users.contains_key(user_id)
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn connection_count(&self) -> usize {
        self.owners.len()
    }
}
