use dashmap::DashMap;
use tokio::time::{Duration, Instant};

use corvid_models::presence::PresenceStatus;
use corvid_models::room::RoomId;

use crate::registry::UserId;

/// A status transition that should be broadcast as PRESENCE_CHANGED.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceChange {
    pub user_id: UserId,
    pub status: PresenceStatus,
}

/// Read-side view of a user's presence. Missing and expired entries are
/// indistinguishable from an explicit offline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceView {
    pub user_id: UserId,
    pub status: PresenceStatus,
    pub room_hint: Option<RoomId>,
}

struct PresenceEntry {
    status: PresenceStatus,
    deadline: Instant,
    room_hint: Option<RoomId>,
    /// Entries learned from peer instances over the bus. The owning
    /// instance broadcasts their offline transition; our sweeper evicts
    /// them silently.
    remote: bool,
}

impl PresenceEntry {
    fn visible(&self, now: Instant) -> PresenceStatus {
        if now >= self.deadline {
            PresenceStatus::Offline
        } else {
            self.status
        }
    }
}

/// Per-user presence with heartbeat-driven expiry. Entries are
/// independently mutable; concurrent heartbeats for different users never
/// contend. Expiry is computed lazily on read, so correctness does not
/// depend on the reclamation pass — that pass only bounds memory and
/// produces the offline broadcasts for entries nobody queried.
pub struct PresenceStore {
    entries: DashMap<UserId, PresenceEntry>,
    ttl: Duration,
}

impl PresenceStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Refresh the deadline and record the requested status. Returns a
    /// change only when the visible status actually moved, so frequent
    /// same-status heartbeats stay silent. With several devices per user
    /// the most recently processed heartbeat wins.
    pub fn heartbeat(
        &self,
        user_id: UserId,
        status: PresenceStatus,
        room_hint: Option<RoomId>,
    ) -> Option<PresenceChange> {
        let now = Instant::now();
        let mut entry = self.entries.entry(user_id).or_insert_with(|| PresenceEntry {
            status: PresenceStatus::Offline,
            deadline: now,
            room_hint: None,
            remote: false,
        });
        let previous = entry.visible(now);
        entry.status = status;
        entry.deadline = now + self.ttl;
        entry.room_hint = room_hint;
        entry.remote = false;
        if previous != status {
            Some(PresenceChange { user_id, status })
        } else {
            None
        }
    }

    /// Apply a PRESENCE_CHANGED learned from a peer instance. Idempotent;
    /// never produces a broadcast of its own.
    pub fn apply_remote(&self, user_id: UserId, status: PresenceStatus) {
        let now = Instant::now();
        match status {
            PresenceStatus::Offline => {
                self.entries.remove(&user_id);
            }
            _ => {
                let mut entry = self.entries.entry(user_id).or_insert_with(|| PresenceEntry {
                    status,
                    deadline: now,
                    room_hint: None,
                    remote: true,
                });
                entry.status = status;
                entry.deadline = now + self.ttl;
                entry.remote = true;
            }
        }
    }

    pub fn query(&self, user_id: UserId) -> PresenceView {
        let now = Instant::now();
        match self.entries.get(&user_id) {
            Some(entry) if now < entry.deadline => PresenceView {
                user_id,
                status: entry.status,
                room_hint: entry.room_hint.clone(),
            },
            _ => PresenceView {
                user_id,
                status: PresenceStatus::Offline,
                room_hint: None,
            },
        }
    }

    pub fn clear_room_hint(&self, user_id: UserId) {
        if let Some(mut entry) = self.entries.get_mut(&user_id) {
            entry.room_hint = None;
        }
    }

    /// Remove expired entries. Returns the offline transitions to
    /// broadcast; remote entries are evicted silently because their owning
    /// instance announces the transition.
    pub fn sweep_expired(&self) -> Vec<PresenceChange> {
        let now = Instant::now();
        let mut evicted = Vec::new();
        self.entries.retain(|user_id, entry| {
            if now < entry.deadline {
                return true;
            }
            if !entry.remote && entry.status != PresenceStatus::Offline {
                evicted.push(PresenceChange {
                    user_id: *user_id,
                    status: PresenceStatus::Offline,
                });
            }
            false
        });
        if !evicted.is_empty() {
            tracing::debug!(count = evicted.len(), "presence entries expired");
        }
        evicted
    }
}
