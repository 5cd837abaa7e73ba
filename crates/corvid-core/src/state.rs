use std::sync::Arc;

use serde_json::json;
use tokio::sync::{broadcast, Notify};
use tokio::time::{Duration, MissedTickBehavior};
use uuid::Uuid;

use corvid_models::gateway::{
    EVENT_CALL_MEMBER_LEFT, EVENT_CALL_SIGNAL, EVENT_MEMBER_JOINED, EVENT_MEMBER_LEFT,
    EVENT_MESSAGE_DELETED, EVENT_MESSAGE_NEW, EVENT_MESSAGE_UPDATED, EVENT_PRESENCE_CHANGED,
    EVENT_TYPING_ACTIVE, EVENT_TYPING_INACTIVE,
};
use corvid_models::presence::{PresenceStatus, PresenceUpdate};
use corvid_models::room::RoomId;
use corvid_models::signal::SignalKind;

use crate::cluster::{publish_or_retry, BusEvent, ClusterBus};
use crate::collab::{IdentityValidator, MessageStore, PermissionChecker};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::fanout::FanoutEngine;
use crate::presence::{PresenceChange, PresenceStore};
use crate::registry::{ConnectionId, ConnectionRegistry, PushEvent, UserId};
use crate::rooms::RoomManager;
use crate::signaling::SignalingRelay;
use crate::typing::TypingTracker;

const TYPING_SWEEP_INTERVAL: Duration = Duration::from_secs(2);

/// Cluster events arrive with owned strings; dispatch frames carry static
/// event names. Unknown names (a newer peer) are dropped with a warning.
fn intern_event(name: &str) -> Option<&'static str> {
    match name {
        "MEMBER_JOINED" => Some(EVENT_MEMBER_JOINED),
        "MEMBER_LEFT" => Some(EVENT_MEMBER_LEFT),
        "MESSAGE_NEW" => Some(EVENT_MESSAGE_NEW),
        "MESSAGE_UPDATED" => Some(EVENT_MESSAGE_UPDATED),
        "MESSAGE_DELETED" => Some(EVENT_MESSAGE_DELETED),
        "PRESENCE_CHANGED" => Some(EVENT_PRESENCE_CHANGED),
        "TYPING_ACTIVE" => Some(EVENT_TYPING_ACTIVE),
        "TYPING_INACTIVE" => Some(EVENT_TYPING_INACTIVE),
        "CALL_SIGNAL" => Some(EVENT_CALL_SIGNAL),
        "CALL_MEMBER_LEFT" => Some(EVENT_CALL_MEMBER_LEFT),
        _ => None,
    }
}

/// Shared handle over every gateway component. One instance of this per
/// gateway process; the transport layer clones it into each connection
/// task.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub instance_id: Uuid,
    pub registry: Arc<ConnectionRegistry>,
    pub rooms: Arc<RoomManager>,
    pub presence: Arc<PresenceStore>,
    pub typing: Arc<TypingTracker>,
    pub fanout: Arc<FanoutEngine>,
    pub signaling: Arc<SignalingRelay>,
    pub identity: Arc<dyn IdentityValidator>,
    pub bus: Arc<dyn ClusterBus>,
    pub shutdown: Arc<Notify>,
}

impl GatewayState {
    pub fn new(
        config: GatewayConfig,
        identity: Arc<dyn IdentityValidator>,
        checker: Arc<dyn PermissionChecker>,
        store: Arc<dyn MessageStore>,
        bus: Arc<dyn ClusterBus>,
    ) -> Self {
        let instance_id = Uuid::new_v4();
        let registry = Arc::new(ConnectionRegistry::new(
            config.max_connections,
            config.max_connections_per_user,
        ));
        let rooms = Arc::new(RoomManager::new(
            registry.clone(),
            checker,
            store.clone(),
            bus.clone(),
            instance_id,
        ));
        let fanout = Arc::new(FanoutEngine::new(
            rooms.clone(),
            registry.clone(),
            store,
            bus.clone(),
            instance_id,
            &config,
        ));
        let signaling = Arc::new(SignalingRelay::new(
            registry.clone(),
            config.call_participant_cap,
            config.signaling_idle_deadline,
        ));
        let presence = Arc::new(PresenceStore::new(config.presence_ttl));
        let typing = Arc::new(TypingTracker::new(config.typing_clear_after));
        Self {
            config: Arc::new(config),
            instance_id,
            registry,
            rooms,
            presence,
            typing,
            fanout,
            signaling,
            identity,
            bus,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Full disconnect cascade, always run when a transport goes away
    /// regardless of cause. Idempotent.
    pub async fn disconnect(&self, connection_id: ConnectionId) {
        let Some(closed) = self.registry.close(connection_id) else {
            return;
        };
        self.rooms.purge_connection(connection_id, &closed.rooms).await;
        self.signaling.remove_connection(connection_id, closed.user_id);
        if self.registry.user_connection_count(closed.user_id) == 0 {
            for room in self.typing.clear_user(closed.user_id) {
                let payload = json!({ "room_id": room, "user_id": closed.user_id });
                self.dispatch_to_room(&room, EVENT_TYPING_INACTIVE, payload).await;
            }
            // The presence entry itself lapses through its TTL; only the
            // hint is tied to the connection.
            self.presence.clear_room_hint(closed.user_id);
        }
        tracing::info!(connection_id = %connection_id, user_id = closed.user_id, "connection released");
    }

    /// Deliver to this instance's members of the room, then tell the
    /// fleet. Local delivery never waits on the bus.
    pub async fn dispatch_to_room(
        &self,
        room: &RoomId,
        event_type: &'static str,
        payload: serde_json::Value,
    ) {
        for member in self.rooms.members_of(room).await {
            self.registry.send(
                member,
                PushEvent {
                    event_type,
                    payload: payload.clone(),
                },
            );
        }
        publish_or_retry(
            self.bus.clone(),
            BusEvent::to_room(self.instance_id, event_type, room.clone(), payload),
        )
        .await;
    }

    async fn broadcast_presence(&self, change: &PresenceChange) {
        let payload = json!({ "user_id": change.user_id, "status": change.status });
        self.registry.broadcast(PushEvent {
            event_type: EVENT_PRESENCE_CHANGED,
            payload: payload.clone(),
        });
        publish_or_retry(
            self.bus.clone(),
            BusEvent::to_all(self.instance_id, EVENT_PRESENCE_CHANGED, payload),
        )
        .await;
    }

    /// Record a heartbeat and broadcast only actual status transitions.
    pub async fn presence_heartbeat(
        &self,
        user_id: UserId,
        status: PresenceStatus,
        room_hint: Option<RoomId>,
    ) {
        if let Some(change) = self.presence.heartbeat(user_id, status, room_hint) {
            self.broadcast_presence(&change).await;
        }
    }

    pub async fn typing_start(&self, connection_id: ConnectionId, room: RoomId) -> Result<()> {
        let user_id = self
            .registry
            .resolve_user(connection_id)
            .ok_or(GatewayError::NotFound)?;
        if !self.rooms.is_member(connection_id, &room).await {
            return Err(GatewayError::Forbidden);
        }
        if self.typing.start(room.clone(), user_id) {
            let payload = json!({ "room_id": room, "user_id": user_id });
            self.dispatch_to_room(&room, EVENT_TYPING_ACTIVE, payload).await;
        }
        Ok(())
    }

    pub async fn typing_stop(&self, connection_id: ConnectionId, room: RoomId) -> Result<()> {
        let user_id = self
            .registry
            .resolve_user(connection_id)
            .ok_or(GatewayError::NotFound)?;
        if self.typing.stop(&room, user_id) {
            let payload = json!({ "room_id": room, "user_id": user_id });
            self.dispatch_to_room(&room, EVENT_TYPING_INACTIVE, payload).await;
        }
        Ok(())
    }

    /// Join the call room and register as a signaling participant. A
    /// capacity reject rolls the membership back so it leaves no trace.
    pub async fn call_join(&self, connection_id: ConnectionId, room: RoomId) -> Result<()> {
        let user_id = self
            .registry
            .resolve_user(connection_id)
            .ok_or(GatewayError::NotFound)?;
        if !room.is_call() {
            return Err(GatewayError::Validation(
                "call operations require a call room".into(),
            ));
        }
        self.rooms.join(connection_id, room.clone()).await?;
        if let Err(err) = self.signaling.join(user_id, connection_id, room.clone()) {
            let _ = self.rooms.leave(connection_id, room).await;
            return Err(err);
        }
        Ok(())
    }

    pub async fn call_leave(&self, connection_id: ConnectionId, room: RoomId) -> Result<()> {
        if let Some(user_id) = self.registry.resolve_user(connection_id) {
            self.signaling.leave(user_id, &room);
        }
        self.rooms.leave(connection_id, room).await
    }

    pub fn call_signal(
        &self,
        connection_id: ConnectionId,
        to_user: UserId,
        room: &RoomId,
        kind: SignalKind,
        payload: serde_json::Value,
    ) -> Result<()> {
        let from_user = self
            .registry
            .resolve_user(connection_id)
            .ok_or(GatewayError::NotFound)?;
        self.signaling.relay(from_user, to_user, room, kind, payload)
    }

    async fn consume_bus_event(&self, event: BusEvent) {
        // Local delivery already happened directly; never replay our own
        // events through the bus loop.
        if event.origin == self.instance_id {
            return;
        }
        let Some(event_type) = intern_event(&event.event_type) else {
            tracing::warn!(event_type = %event.event_type, "unknown cluster event dropped");
            return;
        };
        if event_type == EVENT_PRESENCE_CHANGED {
            // Keep this instance's presence view in sync so queries here
            // agree with the owning instance. Redelivery is harmless.
            if let Ok(update) = serde_json::from_value::<PresenceUpdate>(event.payload.clone()) {
                self.presence.apply_remote(update.user_id, update.status);
            }
        }
        match (&event.room, &event.target_user_ids) {
            (Some(room), _) => {
                for member in self.rooms.members_of(room).await {
                    self.registry.send(
                        member,
                        PushEvent {
                            event_type,
                            payload: event.payload.clone(),
                        },
                    );
                }
            }
            (None, Some(targets)) => {
                for target in targets {
                    self.registry.send_to_user(
                        *target,
                        PushEvent {
                            event_type,
                            payload: event.payload.clone(),
                        },
                    );
                }
            }
            (None, None) => {
                self.registry.broadcast(PushEvent {
                    event_type,
                    payload: event.payload,
                });
            }
        }
    }

    /// Spawn the reclamation sweeps and the cluster consumer. All of them
    /// stop on the shutdown notify.
    pub fn spawn_maintenance(&self) {
        let state = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(state.config.presence_sweep_interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval.tick().await; // skip immediate first tick
            loop {
                tokio::select! {
                    _ = state.shutdown.notified() => break,
                    _ = interval.tick() => {
                        for change in state.presence.sweep_expired() {
                            state.broadcast_presence(&change).await;
                        }
                    }
                }
            }
        });

        let state = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TYPING_SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = state.shutdown.notified() => break,
                    _ = interval.tick() => {
                        for (room, user_id) in state.typing.sweep_expired() {
                            let payload = json!({ "room_id": room, "user_id": user_id });
                            state.dispatch_to_room(&room, EVENT_TYPING_INACTIVE, payload).await;
                        }
                    }
                }
            }
        });

        let state = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(state.config.signaling_idle_deadline / 2);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = state.shutdown.notified() => break,
                    _ = interval.tick() => {
                        state.signaling.sweep_idle();
                    }
                }
            }
        });

        let state = self.clone();
        let mut bus_rx = self.bus.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = state.shutdown.notified() => break,
                    received = bus_rx.recv() => match received {
                        Ok(event) => state.consume_bus_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "cluster bus consumer lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
    }
}
