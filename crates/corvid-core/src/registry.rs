use std::collections::HashSet;
use std::fmt;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use corvid_models::room::RoomId;

pub type UserId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An event queued for one connection. The transport task wraps it in the
/// dispatch envelope and assigns the per-connection sequence number.
#[derive(Debug, Clone)]
pub struct PushEvent {
    pub event_type: &'static str,
    pub payload: serde_json::Value,
}

pub type OutboundSender = mpsc::UnboundedSender<PushEvent>;

struct ConnectionEntry {
    user_id: UserId,
    outbound: OutboundSender,
    /// Rooms this connection belongs to, kept in lockstep with the room
    /// manager's member sets (updated under the room lock).
    rooms: HashSet<RoomId>,
    last_activity: Instant,
}

/// Everything known about a connection at the moment it was closed; the
/// disconnect cascade walks `rooms` to release memberships.
pub struct ClosedConnection {
    pub user_id: UserId,
    pub rooms: Vec<RoomId>,
}

/// Owns the set of live connections. Each connection is admitted exactly
/// once after identity verification and removed exactly once, on transport
/// disconnect or forced eviction; everything in between is best-effort
/// frame delivery.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionEntry>,
    by_user: DashMap<UserId, HashSet<ConnectionId>>,
    max_connections: usize,
    max_per_user: usize,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize, max_per_user: usize) -> Self {
        Self {
            connections: DashMap::new(),
            by_user: DashMap::new(),
            max_connections,
            max_per_user,
        }
    }

    pub fn at_capacity(&self) -> bool {
        self.connections.len() >= self.max_connections
    }

    /// Admit a verified connection. Returns `None` when the gateway or the
    /// user is at their connection cap; the transport closes the socket
    /// with a capacity code in that case.
    pub fn try_open(&self, user_id: UserId, outbound: OutboundSender) -> Option<ConnectionId> {
        if self.at_capacity() {
            return None;
        }
        let id = ConnectionId::new();
        {
            let mut owned = self.by_user.entry(user_id).or_default();
            if owned.len() >= self.max_per_user {
                drop(owned);
                self.by_user.remove_if(&user_id, |_, set| set.is_empty());
                return None;
            }
            owned.insert(id);
        }
        self.connections.insert(
            id,
            ConnectionEntry {
                user_id,
                outbound,
                rooms: HashSet::new(),
                last_activity: Instant::now(),
            },
        );
        tracing::debug!(connection_id = %id, user_id, "connection opened");
        Some(id)
    }

    /// Idempotent removal. Returns what was released so the caller can run
    /// the disconnect cascade (room purge, signaling leave, typing clear).
    pub fn close(&self, connection_id: ConnectionId) -> Option<ClosedConnection> {
        let (_, entry) = self.connections.remove(&connection_id)?;
        if let Some(mut owned) = self.by_user.get_mut(&entry.user_id) {
            owned.remove(&connection_id);
            if owned.is_empty() {
                drop(owned);
                self.by_user.remove_if(&entry.user_id, |_, set| set.is_empty());
            }
        }
        tracing::debug!(connection_id = %connection_id, user_id = entry.user_id, "connection closed");
        Some(ClosedConnection {
            user_id: entry.user_id,
            rooms: entry.rooms.into_iter().collect(),
        })
    }

    /// Best-effort delivery to one connection. A gone transport is a no-op;
    /// the disconnect path is already in flight.
    pub fn send(&self, connection_id: ConnectionId, event: PushEvent) {
        if let Some(entry) = self.connections.get(&connection_id) {
            let _ = entry.outbound.send(event);
        }
    }

    pub fn send_to_user(&self, user_id: UserId, event: PushEvent) {
        if let Some(owned) = self.by_user.get(&user_id) {
            for connection_id in owned.iter() {
                self.send(*connection_id, event.clone());
            }
        }
    }

    pub fn broadcast(&self, event: PushEvent) {
        for entry in self.connections.iter() {
            let _ = entry.outbound.send(event.clone());
        }
    }

    pub fn resolve_user(&self, connection_id: ConnectionId) -> Option<UserId> {
        self.connections.get(&connection_id).map(|e| e.user_id)
    }

    pub fn touch(&self, connection_id: ConnectionId) {
        if let Some(mut entry) = self.connections.get_mut(&connection_id) {
            entry.last_activity = Instant::now();
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn user_connection_count(&self, user_id: UserId) -> usize {
        self.by_user.get(&user_id).map(|s| s.len()).unwrap_or(0)
    }

    pub(crate) fn note_room_joined(&self, connection_id: ConnectionId, room: &RoomId) {
        if let Some(mut entry) = self.connections.get_mut(&connection_id) {
            entry.rooms.insert(room.clone());
        }
    }

    pub(crate) fn note_room_left(&self, connection_id: ConnectionId, room: &RoomId) {
        if let Some(mut entry) = self.connections.get_mut(&connection_id) {
            entry.rooms.remove(room);
        }
    }

    pub fn rooms_of(&self, connection_id: ConnectionId) -> Vec<RoomId> {
        self.connections
            .get(&connection_id)
            .map(|e| e.rooms.iter().cloned().collect())
            .unwrap_or_default()
    }
}
