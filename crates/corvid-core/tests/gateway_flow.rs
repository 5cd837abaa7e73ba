//! End-to-end flows across two gateway instances sharing one loopback
//! cluster bus and one message store, with mpsc channels standing in for
//! client transports.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use corvid_core::cluster::LoopbackBus;
use corvid_core::collab::{AllowAll, JwtIdentityValidator, MemoryMessageStore};
use corvid_core::registry::{ConnectionId, PushEvent};
use corvid_core::{GatewayConfig, GatewayError, GatewayState};
use corvid_models::gateway::{
    EVENT_CALL_SIGNAL, EVENT_MEMBER_LEFT, EVENT_MESSAGE_NEW, EVENT_PRESENCE_CHANGED,
    EVENT_TYPING_ACTIVE, EVENT_TYPING_INACTIVE,
};
use corvid_models::presence::PresenceStatus;
use corvid_models::room::RoomId;
use corvid_models::signal::SignalKind;

fn node_with_config(
    bus: &Arc<LoopbackBus>,
    store: &Arc<MemoryMessageStore>,
    config: GatewayConfig,
) -> GatewayState {
    let state = GatewayState::new(
        config,
        Arc::new(JwtIdentityValidator::new(
            "integration-test-secret-integration-test-secret",
        )),
        Arc::new(AllowAll),
        store.clone(),
        bus.clone(),
    );
    state.spawn_maintenance();
    state
}

fn node(bus: &Arc<LoopbackBus>, store: &Arc<MemoryMessageStore>) -> GatewayState {
    node_with_config(bus, store, GatewayConfig::default())
}

fn connect(state: &GatewayState, user: i64) -> (ConnectionId, mpsc::UnboundedReceiver<PushEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let id = state.registry.try_open(user, tx).expect("open connection");
    (id, rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<PushEvent>) -> Vec<PushEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn sequences_of(events: &[PushEvent]) -> Vec<u64> {
    events
        .iter()
        .filter(|e| e.event_type == EVENT_MESSAGE_NEW)
        .map(|e| e.payload["sequence"].as_u64().expect("sequence"))
        .collect()
}

/// Let spawned consumers (bus loop, background publishes) run.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn fanout_is_ordered_deduplicated_and_cluster_wide() {
    let bus = Arc::new(LoopbackBus::default());
    let store = Arc::new(MemoryMessageStore::new());
    let node1 = node(&bus, &store);
    let node2 = node(&bus, &store);
    let room = RoomId::Channel(7);

    let (a, mut rx_a) = connect(&node1, 1);
    let (b, mut rx_b) = connect(&node1, 2);
    let (c, mut rx_c) = connect(&node2, 3);
    node1.rooms.join(a, room.clone()).await.expect("join a");
    node1.rooms.join(b, room.clone()).await.expect("join b");
    node2.rooms.join(c, room.clone()).await.expect("join c");
    settle().await;
    drain(&mut rx_a);
    drain(&mut rx_b);
    drain(&mut rx_c);

    for (i, key) in ["k1", "k2", "k3"].iter().enumerate() {
        let message = node1
            .fanout
            .send(a, room.clone(), format!("message {i}"), key.to_string())
            .await
            .expect("send");
        assert_eq!(message.sequence, i as u64 + 1);
    }
    settle().await;

    // Both local members and the peer instance's member observe the same
    // gapless, strictly increasing stream.
    assert_eq!(sequences_of(&drain(&mut rx_a)), vec![1, 2, 3]);
    assert_eq!(sequences_of(&drain(&mut rx_b)), vec![1, 2, 3]);
    assert_eq!(sequences_of(&drain(&mut rx_c)), vec![1, 2, 3]);

    // A retry of k2 returns the original record, produces no sequence 4
    // and no redelivery anywhere.
    let replay = node1
        .fanout
        .send(a, room.clone(), "message 1".into(), "k2".into())
        .await
        .expect("replay");
    assert_eq!(replay.sequence, 2);
    settle().await;
    assert!(sequences_of(&drain(&mut rx_b)).is_empty());
    assert!(sequences_of(&drain(&mut rx_c)).is_empty());
}

#[tokio::test]
async fn disconnect_releases_every_room_membership() {
    let bus = Arc::new(LoopbackBus::default());
    let store = Arc::new(MemoryMessageStore::new());
    let node1 = node(&bus, &store);

    let (a, _rx_a) = connect(&node1, 1);
    let (b, mut rx_b) = connect(&node1, 2);
    let rooms = [RoomId::Channel(1), RoomId::Conversation(9)];
    for room in &rooms {
        node1.rooms.join(a, room.clone()).await.expect("join a");
        node1.rooms.join(b, room.clone()).await.expect("join b");
    }
    drain(&mut rx_b);

    node1.disconnect(a).await;
    for room in &rooms {
        assert_eq!(node1.rooms.members_of(room).await, vec![b]);
    }
    let left: Vec<_> = drain(&mut rx_b)
        .into_iter()
        .filter(|e| e.event_type == EVENT_MEMBER_LEFT)
        .collect();
    assert_eq!(left.len(), 2);
    for event in left {
        assert_eq!(event.payload["user_id"], 1);
    }
    // A second disconnect of the same connection is a no-op.
    node1.disconnect(a).await;
}

#[tokio::test]
async fn presence_changes_reach_the_whole_fleet_and_expire() {
    let bus = Arc::new(LoopbackBus::default());
    let store = Arc::new(MemoryMessageStore::new());
    let mut config = GatewayConfig::default();
    config.presence_ttl = Duration::from_millis(300);
    let node1 = node_with_config(&bus, &store, config.clone());
    let node2 = node_with_config(&bus, &store, config);

    let (_a, mut rx_a) = connect(&node1, 1);
    let (_b, mut rx_b) = connect(&node2, 2);

    node1.presence_heartbeat(1, PresenceStatus::Online, None).await;
    settle().await;
    let statuses: Vec<_> = drain(&mut rx_b)
        .into_iter()
        .filter(|e| e.event_type == EVENT_PRESENCE_CHANGED)
        .map(|e| e.payload["status"].as_str().expect("status").to_string())
        .collect();
    assert_eq!(statuses, vec!["online"]);
    assert_eq!(node2.presence.query(1).status, PresenceStatus::Online);

    // Same-status renewals stay silent.
    node1.presence_heartbeat(1, PresenceStatus::Online, None).await;
    settle().await;
    assert!(drain(&mut rx_b)
        .iter()
        .all(|e| e.event_type != EVENT_PRESENCE_CHANGED));

    // No renewal within the TTL: the sweeper evicts and broadcasts the
    // offline transition; queries on both instances agree.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(node1.presence.query(1).status, PresenceStatus::Offline);
    assert_eq!(node2.presence.query(1).status, PresenceStatus::Offline);
    let offline_seen = drain(&mut rx_a)
        .into_iter()
        .chain(drain(&mut rx_b))
        .any(|e| {
            e.event_type == EVENT_PRESENCE_CHANGED && e.payload["status"] == "offline"
        });
    assert!(offline_seen, "sweeper broadcasts the offline transition");
}

#[tokio::test]
async fn signaling_follows_membership_exactly() {
    let bus = Arc::new(LoopbackBus::default());
    let store = Arc::new(MemoryMessageStore::new());
    let node1 = node(&bus, &store);
    let room = RoomId::Call(42);

    let (a, mut rx_a) = connect(&node1, 1);
    let (b, mut rx_b) = connect(&node1, 2);
    node1.call_join(a, room.clone()).await.expect("join a");
    node1.call_join(b, room.clone()).await.expect("join b");
    drain(&mut rx_a);
    drain(&mut rx_b);

    node1
        .call_signal(a, 2, &room, SignalKind::Offer, serde_json::json!({"sdp": "v=0"}))
        .expect("offer");
    let event = rx_b.recv().await.expect("signal");
    assert_eq!(event.event_type, EVENT_CALL_SIGNAL);
    assert_eq!(event.payload["from_user_id"], 1);

    // B leaves before the next offer: the relay refuses and nothing is
    // queued for later.
    node1.call_leave(b, room.clone()).await.expect("leave b");
    assert!(matches!(
        node1.call_signal(a, 2, &room, SignalKind::Offer, serde_json::json!({})),
        Err(GatewayError::NotFound)
    ));
    let queued: Vec<_> = drain(&mut rx_b)
        .into_iter()
        .filter(|e| e.event_type == EVENT_CALL_SIGNAL)
        .collect();
    assert!(queued.is_empty());
}

#[tokio::test]
async fn call_capacity_rejects_and_leaves_no_membership_behind() {
    let bus = Arc::new(LoopbackBus::default());
    let store = Arc::new(MemoryMessageStore::new());
    let mut config = GatewayConfig::default();
    config.call_participant_cap = 1;
    let node1 = node_with_config(&bus, &store, config);
    let room = RoomId::Call(42);

    let (a, _rx_a) = connect(&node1, 1);
    let (b, _rx_b) = connect(&node1, 2);
    node1.call_join(a, room.clone()).await.expect("join a");
    assert!(matches!(
        node1.call_join(b, room.clone()).await,
        Err(GatewayError::RoomFull)
    ));
    assert_eq!(node1.rooms.members_of(&room).await, vec![a]);
}

#[tokio::test]
async fn typing_edges_reach_room_members_on_both_instances() {
    let bus = Arc::new(LoopbackBus::default());
    let store = Arc::new(MemoryMessageStore::new());
    let node1 = node(&bus, &store);
    let node2 = node(&bus, &store);
    let room = RoomId::Channel(7);

    let (a, _rx_a) = connect(&node1, 1);
    let (c, mut rx_c) = connect(&node2, 3);
    node1.rooms.join(a, room.clone()).await.expect("join a");
    node2.rooms.join(c, room.clone()).await.expect("join c");
    settle().await;
    drain(&mut rx_c);

    node1.typing_start(a, room.clone()).await.expect("start");
    // Repeated starts inside the window stay silent.
    node1.typing_start(a, room.clone()).await.expect("restart");
    node1.typing_stop(a, room.clone()).await.expect("stop");
    settle().await;

    let edges: Vec<_> = drain(&mut rx_c)
        .into_iter()
        .filter(|e| {
            e.event_type == EVENT_TYPING_ACTIVE || e.event_type == EVENT_TYPING_INACTIVE
        })
        .map(|e| e.event_type)
        .collect();
    assert_eq!(edges, vec![EVENT_TYPING_ACTIVE, EVENT_TYPING_INACTIVE]);

    // Typing in a room you are not a member of is refused.
    let (outsider, _rx) = connect(&node1, 9);
    assert!(matches!(
        node1.typing_start(outsider, room).await,
        Err(GatewayError::Forbidden)
    ));
}
