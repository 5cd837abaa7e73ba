use std::sync::Arc;

use chrono::Utc;
use moka::sync::Cache;
use serde_json::json;
use uuid::Uuid;

use corvid_models::gateway::{EVENT_MESSAGE_DELETED, EVENT_MESSAGE_NEW, EVENT_MESSAGE_UPDATED};
use corvid_models::message::{FanoutMessage, MessageOp};
use corvid_models::room::RoomId;

use crate::cluster::{publish_or_retry, BusEvent, ClusterBus};
use crate::collab::MessageStore;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::registry::{ConnectionId, ConnectionRegistry, PushEvent};
use crate::rooms::RoomManager;

fn event_for(op: MessageOp) -> &'static str {
    match op {
        MessageOp::Create => EVENT_MESSAGE_NEW,
        MessageOp::Edit => EVENT_MESSAGE_UPDATED,
        MessageOp::Delete => EVENT_MESSAGE_DELETED,
    }
}

fn wire_payload(message: &FanoutMessage) -> serde_json::Value {
    json!({
        "message_id": message.id,
        "room_id": message.room,
        "sender_id": message.sender_id,
        "op": message.op,
        "payload": message.payload,
        "sequence": message.sequence,
        "created_at": message.created_at,
    })
}

/// Assigns per-room order, persists through the external store and
/// delivers to room members locally and across the cluster. The per-room
/// lock is held from sequence assignment through local dispatch and the
/// bus enqueue, so every member — local or on a peer instance — observes
/// a room's messages in sequence order with no gaps. Local delivery is
/// dispatched before the bus sees the event and never waits on a peer.
pub struct FanoutEngine {
    rooms: Arc<RoomManager>,
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn MessageStore>,
    bus: Arc<dyn ClusterBus>,
    instance_id: Uuid,
    max_payload_bytes: usize,
    /// Recently accepted sends keyed by (room, idempotency key). A client
    /// retry inside the window gets the original record back instead of a
    /// new sequence number.
    dedup: Cache<(RoomId, String), FanoutMessage>,
}

impl FanoutEngine {
    pub fn new(
        rooms: Arc<RoomManager>,
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn MessageStore>,
        bus: Arc<dyn ClusterBus>,
        instance_id: Uuid,
        config: &GatewayConfig,
    ) -> Self {
        Self {
            rooms,
            registry,
            store,
            bus,
            instance_id,
            max_payload_bytes: config.max_payload_bytes,
            dedup: Cache::builder()
                .max_capacity(config.dedup_max_entries)
                .time_to_live(config.dedup_window)
                .build(),
        }
    }

    fn validate_payload(&self, payload: &str) -> Result<()> {
        if payload.is_empty() {
            return Err(GatewayError::Validation("payload must not be empty".into()));
        }
        if payload.len() > self.max_payload_bytes {
            return Err(GatewayError::Validation(format!(
                "payload exceeds {} bytes",
                self.max_payload_bytes
            )));
        }
        Ok(())
    }

    /// Accept, order, persist and deliver one message send.
    pub async fn send(
        &self,
        connection_id: ConnectionId,
        room: RoomId,
        payload: String,
        idempotency_key: String,
    ) -> Result<FanoutMessage> {
        let sender_id = self
            .registry
            .resolve_user(connection_id)
            .ok_or(GatewayError::NotFound)?;
        if !room.is_sequenced() {
            return Err(GatewayError::Validation(
                "call rooms have no message stream".into(),
            ));
        }
        self.validate_payload(&payload)?;
        if idempotency_key.is_empty() {
            return Err(GatewayError::Validation("idempotency key required".into()));
        }

        let dedup_key = (room.clone(), idempotency_key.clone());
        if let Some(previous) = self.dedup.get(&dedup_key) {
            tracing::debug!(room = %room, key = %idempotency_key, "duplicate send absorbed");
            return Ok(previous);
        }

        let mut state = self.rooms.lock_room(&room).await;
        if !state.members.contains_key(&connection_id) {
            drop(state);
            self.rooms.reclaim_if_empty(&room);
            return Err(GatewayError::Forbidden);
        }
        // Re-check under the lock; a racing retry may have landed while we
        // waited for the room.
        if let Some(previous) = self.dedup.get(&dedup_key) {
            return Ok(previous);
        }

        state.sequence += 1;
        let message = FanoutMessage {
            id: Uuid::new_v4().to_string(),
            room: room.clone(),
            sender_id,
            op: MessageOp::Create,
            payload,
            sequence: state.sequence,
            idempotency_key,
            created_at: Utc::now(),
        };
        if let Err(err) = self.store.append(&message).await {
            // Roll the counter back so the stream stays gapless; nothing
            // was delivered for this sequence.
            state.sequence -= 1;
            return Err(err);
        }
        self.dedup.insert(dedup_key, message.clone());

        let payload = wire_payload(&message);
        for member in state.members.keys() {
            self.registry.send(
                *member,
                PushEvent {
                    event_type: EVENT_MESSAGE_NEW,
                    payload: payload.clone(),
                },
            );
        }
        // Publishing inside the critical section keeps the bus stream in
        // sequence order; peers' members see the same gapless stream.
        publish_or_retry(
            self.bus.clone(),
            BusEvent::to_room(self.instance_id, EVENT_MESSAGE_NEW, room, payload),
        )
        .await;
        drop(state);
        tracing::debug!(room = %message.room, sequence = message.sequence, "message fanned out");
        Ok(message)
    }

    /// Replace a message's payload. Only the original sender may edit.
    pub async fn edit(
        &self,
        connection_id: ConnectionId,
        message_id: &str,
        payload: String,
    ) -> Result<FanoutMessage> {
        self.validate_payload(&payload)?;
        self.mutate(connection_id, message_id, MessageOp::Edit, payload)
            .await
    }

    /// Retract a message. Only the original sender may delete.
    pub async fn delete(
        &self,
        connection_id: ConnectionId,
        message_id: &str,
    ) -> Result<FanoutMessage> {
        self.mutate(connection_id, message_id, MessageOp::Delete, String::new())
            .await
    }

    /// Edits and deletes run the send pipeline with an operation kind:
    /// same sequencer, same store round-trip, same delivery paths.
    async fn mutate(
        &self,
        connection_id: ConnectionId,
        message_id: &str,
        op: MessageOp,
        payload: String,
    ) -> Result<FanoutMessage> {
        let sender_id = self
            .registry
            .resolve_user(connection_id)
            .ok_or(GatewayError::NotFound)?;
        let original = self
            .store
            .fetch(message_id)
            .await?
            .ok_or(GatewayError::NotFound)?;
        if original.sender_id != sender_id {
            return Err(GatewayError::Forbidden);
        }
        let room = original.room;

        let mut state = self.rooms.lock_room(&room).await;
        if !state.members.contains_key(&connection_id) {
            drop(state);
            self.rooms.reclaim_if_empty(&room);
            return Err(GatewayError::Forbidden);
        }

        state.sequence += 1;
        let kind = match op {
            MessageOp::Edit => "edit",
            _ => "delete",
        };
        let record = FanoutMessage {
            id: message_id.to_string(),
            room: room.clone(),
            sender_id,
            op,
            payload,
            sequence: state.sequence,
            idempotency_key: format!("{kind}:{message_id}"),
            created_at: Utc::now(),
        };
        if let Err(err) = self.store.append(&record).await {
            state.sequence -= 1;
            return Err(err);
        }

        let event_type = event_for(op);
        let payload = wire_payload(&record);
        for member in state.members.keys() {
            self.registry.send(
                *member,
                PushEvent {
                    event_type,
                    payload: payload.clone(),
                },
            );
        }
        publish_or_retry(
            self.bus.clone(),
            BusEvent::to_room(self.instance_id, event_type, room, payload),
        )
        .await;
        drop(state);
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::LoopbackBus;
    use crate::collab::{AllowAll, MemoryMessageStore, MessageStore};
    use crate::registry::UserId;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct FailingStore;

    #[async_trait]
    impl MessageStore for FailingStore {
        async fn append(&self, _record: &FanoutMessage) -> Result<()> {
            Err(GatewayError::Store("disk on fire".into()))
        }
        async fn fetch(&self, _message_id: &str) -> Result<Option<FanoutMessage>> {
            Ok(None)
        }
        async fn last_sequence(&self, _room: &RoomId) -> Result<u64> {
            Ok(0)
        }
    }

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        rooms: Arc<RoomManager>,
        engine: FanoutEngine,
    }

    fn fixture_with_store(store: Arc<dyn MessageStore>) -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new(100, 10));
        let bus: Arc<dyn ClusterBus> = Arc::new(LoopbackBus::default());
        let instance_id = Uuid::new_v4();
        let rooms = Arc::new(RoomManager::new(
            registry.clone(),
            Arc::new(AllowAll),
            store.clone(),
            bus.clone(),
            instance_id,
        ));
        let engine = FanoutEngine::new(
            rooms.clone(),
            registry.clone(),
            store,
            bus,
            instance_id,
            &GatewayConfig::default(),
        );
        Fixture {
            registry,
            rooms,
            engine,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_store(Arc::new(MemoryMessageStore::new()))
    }

    async fn member(
        fixture: &Fixture,
        user: UserId,
        room: &RoomId,
    ) -> (ConnectionId, mpsc::UnboundedReceiver<PushEvent>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = fixture.registry.try_open(user, tx).expect("open");
        fixture.rooms.join(conn, room.clone()).await.expect("join");
        // Drop membership chatter so tests only see the message stream.
        while rx.try_recv().is_ok() {}
        (conn, rx)
    }

    #[tokio::test]
    async fn members_observe_gapless_increasing_sequences() {
        let fixture = fixture();
        let room = RoomId::Channel(7);
        let (a, _rx_a) = member(&fixture, 1, &room).await;
        let (_b, mut rx_b) = member(&fixture, 2, &room).await;
        // Joining b after a queued a MEMBER_JOINED for a's stream too.
        let mut rx_b_events = Vec::new();

        for (i, key) in ["k1", "k2", "k3"].iter().enumerate() {
            let message = fixture
                .engine
                .send(a, room.clone(), format!("msg {i}"), key.to_string())
                .await
                .expect("send");
            assert_eq!(message.sequence, i as u64 + 1);
        }

        while let Ok(event) = rx_b.try_recv() {
            if event.event_type == EVENT_MESSAGE_NEW {
                rx_b_events.push(event.payload["sequence"].as_u64().expect("sequence"));
            }
        }
        assert_eq!(rx_b_events, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn duplicate_send_returns_original_without_redelivery() {
        let fixture = fixture();
        let room = RoomId::Channel(7);
        let (a, _rx_a) = member(&fixture, 1, &room).await;
        let (_b, mut rx_b) = member(&fixture, 2, &room).await;

        let first = fixture
            .engine
            .send(a, room.clone(), "hello".into(), "k2".into())
            .await
            .expect("send");
        while rx_b.try_recv().is_ok() {}

        let replay = fixture
            .engine
            .send(a, room.clone(), "hello".into(), "k2".into())
            .await
            .expect("replay");
        assert_eq!(replay.id, first.id);
        assert_eq!(replay.sequence, first.sequence);
        assert!(rx_b.try_recv().is_err(), "duplicate must not be redelivered");
    }

    #[tokio::test]
    async fn non_members_cannot_send() {
        let fixture = fixture();
        let room = RoomId::Channel(7);
        let (tx, _rx) = mpsc::unbounded_channel();
        let outsider = fixture.registry.try_open(9, tx).expect("open");
        assert!(matches!(
            fixture
                .engine
                .send(outsider, room, "hi".into(), "k".into())
                .await,
            Err(GatewayError::Forbidden)
        ));
    }

    #[tokio::test]
    async fn payload_validation() {
        let fixture = fixture();
        let room = RoomId::Channel(7);
        let (a, _rx) = member(&fixture, 1, &room).await;

        assert!(matches!(
            fixture.engine.send(a, room.clone(), String::new(), "k".into()).await,
            Err(GatewayError::Validation(_))
        ));
        let oversized = "x".repeat(4001);
        assert!(matches!(
            fixture.engine.send(a, room.clone(), oversized, "k".into()).await,
            Err(GatewayError::Validation(_))
        ));
        assert!(matches!(
            fixture.engine.send(a, RoomId::Call(1), "hi".into(), "k".into()).await,
            Err(GatewayError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn store_failure_aborts_send_and_keeps_stream_gapless() {
        let failing = fixture_with_store(Arc::new(FailingStore));
        let room = RoomId::Channel(7);
        let (a, mut rx_a) = member(&failing, 1, &room).await;

        assert!(matches!(
            failing
                .engine
                .send(a, room.clone(), "hi".into(), "k1".into())
                .await,
            Err(GatewayError::Store(_))
        ));
        assert!(rx_a.try_recv().is_err(), "failed sends deliver nothing");

        // Same engine wiring, now with a store that accepts: the sequence
        // restarts at 1 because the failed attempt rolled back.
        let fixture = fixture();
        let (a, _rx) = member(&fixture, 1, &room).await;
        let message = fixture
            .engine
            .send(a, room.clone(), "hi".into(), "k1".into())
            .await
            .expect("send");
        assert_eq!(message.sequence, 1);
    }

    #[tokio::test]
    async fn edit_and_delete_require_original_sender() {
        let fixture = fixture();
        let room = RoomId::Channel(7);
        let (a, _rx_a) = member(&fixture, 1, &room).await;
        let (b, mut rx_b) = member(&fixture, 2, &room).await;

        let message = fixture
            .engine
            .send(a, room.clone(), "hello".into(), "k1".into())
            .await
            .expect("send");
        while rx_b.try_recv().is_ok() {}

        assert!(matches!(
            fixture.engine.edit(b, &message.id, "hijack".into()).await,
            Err(GatewayError::Forbidden)
        ));
        assert!(matches!(
            fixture.engine.delete(b, &message.id).await,
            Err(GatewayError::Forbidden)
        ));

        let edited = fixture
            .engine
            .edit(a, &message.id, "hello v2".into())
            .await
            .expect("edit");
        assert_eq!(edited.sequence, 2);
        let event = rx_b.recv().await.expect("event");
        assert_eq!(event.event_type, EVENT_MESSAGE_UPDATED);

        let deleted = fixture.engine.delete(a, &message.id).await.expect("delete");
        assert_eq!(deleted.sequence, 3);
        // The record is gone; a second delete has nothing to act on.
        assert!(matches!(
            fixture.engine.delete(a, &message.id).await,
            Err(GatewayError::NotFound)
        ));
    }
}
