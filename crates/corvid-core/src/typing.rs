use dashmap::DashMap;
use tokio::time::{Duration, Instant};

use corvid_models::room::RoomId;

use crate::registry::UserId;

/// Typing indicators keyed by (room, user). Start/stop report edges only,
/// so repeated keystroke bursts do not re-broadcast; an indicator left
/// running auto-clears after the configured inactivity window.
pub struct TypingTracker {
    active: DashMap<(RoomId, UserId), Instant>,
    clear_after: Duration,
}

impl TypingTracker {
    pub fn new(clear_after: Duration) -> Self {
        Self {
            active: DashMap::new(),
            clear_after,
        }
    }

    /// Returns true when the user was not already typing in the room
    /// (edge to broadcast). Always refreshes the auto-clear deadline.
    pub fn start(&self, room: RoomId, user_id: UserId) -> bool {
        let now = Instant::now();
        let deadline = now + self.clear_after;
        match self.active.insert((room, user_id), deadline) {
            Some(previous) => now >= previous,
            None => true,
        }
    }

    /// Returns true when the user was actively typing (edge to broadcast).
    pub fn stop(&self, room: &RoomId, user_id: UserId) -> bool {
        match self.active.remove(&(room.clone(), user_id)) {
            Some((_, deadline)) => Instant::now() < deadline,
            None => false,
        }
    }

    /// Expired indicators, for the sweeper to broadcast as TYPING_INACTIVE.
    pub fn sweep_expired(&self) -> Vec<(RoomId, UserId)> {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.active.retain(|(room, user_id), deadline| {
            if now < *deadline {
                return true;
            }
            expired.push((room.clone(), *user_id));
            false
        });
        expired
    }

    /// Disconnect cascade: drop the user's pending indicators without
    /// waiting for their deadlines. Returns the rooms to notify.
    pub fn clear_user(&self, user_id: UserId) -> Vec<RoomId> {
        let mut cleared = Vec::new();
        self.active.retain(|(room, owner), deadline| {
            if *owner != user_id {
                return true;
            }
            if Instant::now() < *deadline {
                cleared.push(room.clone());
            }
            false
        });
        cleared
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn start_and_stop_report_edges_only() {
        let tracker = TypingTracker::new(Duration::from_secs(8));
        let room = RoomId::Channel(7);
        assert!(tracker.start(room.clone(), 1));
        assert!(!tracker.start(room.clone(), 1));
        assert!(tracker.stop(&room, 1));
        assert!(!tracker.stop(&room, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn auto_clears_after_inactivity() {
        let tracker = TypingTracker::new(Duration::from_secs(8));
        let room = RoomId::Channel(7);
        tracker.start(room.clone(), 1);
        tokio::time::advance(Duration::from_secs(5)).await;
        // Renewed mid-window: deadline moves to t=13.
        tracker.start(room.clone(), 1);
        tokio::time::advance(Duration::from_secs(7)).await;
        assert!(tracker.sweep_expired().is_empty());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(tracker.sweep_expired(), vec![(room, 1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_user_cancels_pending_indicators() {
        let tracker = TypingTracker::new(Duration::from_secs(8));
        tracker.start(RoomId::Channel(1), 1);
        tracker.start(RoomId::Channel(2), 1);
        tracker.start(RoomId::Channel(1), 2);
        let mut cleared = tracker.clear_user(1);
        cleared.sort_by_key(|r| r.to_string());
        assert_eq!(cleared, vec![RoomId::Channel(1), RoomId::Channel(2)]);
        // User 2's indicator survives.
        assert!(tracker.stop(&RoomId::Channel(1), 2));
    }
}
