use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use corvid_models::gateway::{EVENT_MEMBER_JOINED, EVENT_MEMBER_LEFT};
use corvid_models::room::RoomId;

use crate::cluster::{publish_or_retry, BusEvent, ClusterBus};
use crate::collab::{MessageStore, PermissionChecker};
use crate::error::{GatewayError, Result};
use crate::registry::{ConnectionId, ConnectionRegistry, PushEvent, UserId};

/// Per-room state. Membership and the sequence counter share one lock:
/// the fan-out engine holds it across sequence assignment, persistence
/// and local dispatch, which is what keeps room streams gapless under
/// concurrent sends.
pub(crate) struct RoomState {
    pub(crate) members: HashMap<ConnectionId, UserId>,
    /// Last assigned sequence for sequenced rooms; seeded from the store
    /// when the room is (re-)created.
    pub(crate) sequence: u64,
}

/// Owns room membership. Rooms are created lazily on first join and
/// reclaimed when the last member leaves; the manager only ever tracks
/// connections of this instance, peers deliver through the cluster bus.
pub struct RoomManager {
    rooms: DashMap<RoomId, Arc<Mutex<RoomState>>>,
    registry: Arc<ConnectionRegistry>,
    checker: Arc<dyn PermissionChecker>,
    store: Arc<dyn MessageStore>,
    bus: Arc<dyn ClusterBus>,
    instance_id: Uuid,
}

impl RoomManager {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        checker: Arc<dyn PermissionChecker>,
        store: Arc<dyn MessageStore>,
        bus: Arc<dyn ClusterBus>,
        instance_id: Uuid,
    ) -> Self {
        Self {
            rooms: DashMap::new(),
            registry,
            checker,
            store,
            bus,
            instance_id,
        }
    }

    async fn handle_for(&self, room: &RoomId) -> Arc<Mutex<RoomState>> {
        if let Some(existing) = self.rooms.get(room) {
            return existing.clone();
        }
        // Seed the sequencer from the store so a reclaimed room resumes
        // its stream instead of reusing sequence numbers.
        let seed = if room.is_sequenced() {
            match self.store.last_sequence(room).await {
                Ok(seq) => seq,
                Err(err) => {
                    tracing::warn!(room = %room, error = %err, "sequence seed lookup failed");
                    0
                }
            }
        } else {
            0
        };
        self.rooms
            .entry(room.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(RoomState {
                    members: HashMap::new(),
                    sequence: seed,
                }))
            })
            .clone()
    }

    /// Lock a room that is guaranteed to still be the live map entry.
    /// A room can be reclaimed between lookup and lock; retry until the
    /// locked handle and the mapped handle agree.
    pub(crate) async fn lock_room(&self, room: &RoomId) -> OwnedMutexGuard<RoomState> {
        loop {
            let handle = self.handle_for(room).await;
            let guard = handle.clone().lock_owned().await;
            let live = self
                .rooms
                .get(room)
                .map(|h| Arc::ptr_eq(h.value(), &handle))
                .unwrap_or(false);
            if live {
                return guard;
            }
        }
    }

    pub(crate) fn reclaim_if_empty(&self, room: &RoomId) {
        // Only reclaim when nobody holds the lock; a concurrent join keeps
        // the room alive and retries through `lock_room`.
        self.rooms.remove_if(room, |_, handle| {
            handle
                .try_lock()
                .map(|state| state.members.is_empty())
                .unwrap_or(false)
        });
    }

    /// Idempotently add the connection to the room after the external
    /// authorization check, and tell the room about it.
    pub async fn join(&self, connection_id: ConnectionId, room: RoomId) -> Result<()> {
        let user_id = self
            .registry
            .resolve_user(connection_id)
            .ok_or(GatewayError::NotFound)?;
        if !self.checker.can_join(user_id, &room).await {
            return Err(GatewayError::Forbidden);
        }
        let mut state = self.lock_room(&room).await;
        if state.members.insert(connection_id, user_id).is_some() {
            return Ok(());
        }
        self.registry.note_room_joined(connection_id, &room);
        tracing::debug!(room = %room, user_id, connection_id = %connection_id, "member joined");
        let payload = json!({ "room_id": room, "user_id": user_id });
        for member in state.members.keys() {
            self.registry.send(
                *member,
                PushEvent {
                    event_type: EVENT_MEMBER_JOINED,
                    payload: payload.clone(),
                },
            );
        }
        // Published under the room lock so peers see membership changes in
        // the same order local members do.
        publish_or_retry(
            self.bus.clone(),
            BusEvent::to_room(self.instance_id, EVENT_MEMBER_JOINED, room, payload),
        )
        .await;
        Ok(())
    }

    /// Idempotent removal; reclaims the room when it empties.
    pub async fn leave(&self, connection_id: ConnectionId, room: RoomId) -> Result<()> {
        let Some(handle) = self.rooms.get(&room).map(|h| h.value().clone()) else {
            return Ok(());
        };
        let mut state = handle.lock().await;
        let Some(user_id) = state.members.remove(&connection_id) else {
            return Ok(());
        };
        self.registry.note_room_left(connection_id, &room);
        tracing::debug!(room = %room, user_id, connection_id = %connection_id, "member left");
        let payload = json!({ "room_id": room, "user_id": user_id });
        for member in state.members.keys() {
            self.registry.send(
                *member,
                PushEvent {
                    event_type: EVENT_MEMBER_LEFT,
                    payload: payload.clone(),
                },
            );
        }
        publish_or_retry(
            self.bus.clone(),
            BusEvent::to_room(self.instance_id, EVENT_MEMBER_LEFT, room.clone(), payload),
        )
        .await;
        let emptied = state.members.is_empty();
        drop(state);
        if emptied {
            self.reclaim_if_empty(&room);
        }
        Ok(())
    }

    /// Connections of this instance currently in the room.
    pub async fn members_of(&self, room: &RoomId) -> Vec<ConnectionId> {
        match self.rooms.get(room).map(|h| h.value().clone()) {
            Some(handle) => handle.lock().await.members.keys().copied().collect(),
            None => Vec::new(),
        }
    }

    pub async fn is_member(&self, connection_id: ConnectionId, room: &RoomId) -> bool {
        match self.rooms.get(room).map(|h| h.value().clone()) {
            Some(handle) => handle.lock().await.members.contains_key(&connection_id),
            None => false,
        }
    }

    /// Disconnect cascade: release every membership the closed connection
    /// held, emitting `MEMBER_LEFT` per room.
    pub async fn purge_connection(&self, connection_id: ConnectionId, rooms: &[RoomId]) {
        for room in rooms {
            let _ = self.leave(connection_id, room.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::LoopbackBus;
    use crate::collab::{AllowAll, MemoryMessageStore};
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct DenyCalls;

    #[async_trait]
    impl PermissionChecker for DenyCalls {
        async fn can_join(&self, _user_id: UserId, room: &RoomId) -> bool {
            !room.is_call()
        }
    }

    fn manager_with(checker: Arc<dyn PermissionChecker>) -> (Arc<ConnectionRegistry>, RoomManager) {
        let registry = Arc::new(ConnectionRegistry::new(100, 10));
        let manager = RoomManager::new(
            registry.clone(),
            checker,
            Arc::new(MemoryMessageStore::new()),
            Arc::new(LoopbackBus::default()),
            Uuid::new_v4(),
        );
        (registry, manager)
    }

    fn connect(registry: &ConnectionRegistry, user: UserId) -> (ConnectionId, mpsc::UnboundedReceiver<PushEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (registry.try_open(user, tx).expect("open"), rx)
    }

    #[tokio::test]
    async fn join_is_idempotent_and_tracked_both_ways() {
        let (registry, manager) = manager_with(Arc::new(AllowAll));
        let (conn, _rx) = connect(&registry, 1);
        let room = RoomId::Channel(7);

        manager.join(conn, room.clone()).await.expect("join");
        manager.join(conn, room.clone()).await.expect("rejoin");

        assert_eq!(manager.members_of(&room).await, vec![conn]);
        assert_eq!(registry.rooms_of(conn), vec![room]);
    }

    #[tokio::test]
    async fn join_denied_by_permission_checker() {
        let (registry, manager) = manager_with(Arc::new(DenyCalls));
        let (conn, _rx) = connect(&registry, 1);
        assert!(matches!(
            manager.join(conn, RoomId::Call(1)).await,
            Err(GatewayError::Forbidden)
        ));
        assert!(manager.members_of(&RoomId::Call(1)).await.is_empty());
    }

    #[tokio::test]
    async fn leave_emits_member_left_and_reclaims_empty_rooms() {
        let (registry, manager) = manager_with(Arc::new(AllowAll));
        let (a, _rx_a) = connect(&registry, 1);
        let (b, mut rx_b) = connect(&registry, 2);
        let room = RoomId::Channel(7);

        manager.join(a, room.clone()).await.expect("join a");
        manager.join(b, room.clone()).await.expect("join b");
        // Drain b's MEMBER_JOINED events.
        while rx_b.try_recv().is_ok() {}

        manager.leave(a, room.clone()).await.expect("leave");
        let event = rx_b.recv().await.expect("event");
        assert_eq!(event.event_type, EVENT_MEMBER_LEFT);
        assert_eq!(event.payload["user_id"], 1);

        manager.leave(b, room.clone()).await.expect("leave b");
        assert!(manager.rooms.get(&room).is_none());
        // Leaving a reclaimed room stays a no-op.
        manager.leave(b, room).await.expect("leave again");
    }

    #[tokio::test]
    async fn purge_connection_releases_every_room() {
        let (registry, manager) = manager_with(Arc::new(AllowAll));
        let (conn, _rx) = connect(&registry, 1);
        let rooms = [RoomId::Channel(1), RoomId::Conversation(2)];
        for room in &rooms {
            manager.join(conn, room.clone()).await.expect("join");
        }

        let closed = registry.close(conn).expect("close");
        manager.purge_connection(conn, &closed.rooms).await;
        for room in &rooms {
            assert!(manager.members_of(room).await.is_empty());
        }
    }
}
