use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::json;
use tokio::time::{Duration, Instant};

use corvid_models::gateway::{EVENT_CALL_MEMBER_LEFT, EVENT_CALL_SIGNAL};
use corvid_models::room::RoomId;
use corvid_models::signal::SignalKind;

use crate::error::{GatewayError, Result};
use crate::registry::{ConnectionId, ConnectionRegistry, PushEvent, UserId};

struct SignalingSession {
    /// Participant -> the connection their signaling flows through. With
    /// several devices the most recent join wins.
    participants: HashMap<UserId, ConnectionId>,
    last_activity: Instant,
}

/// Relays call-setup payloads (offer/answer/ICE) between the participants
/// of a call room. Payloads are delivered immediately or dropped — stale
/// signaling is useless once superseded, so nothing is queued or retried.
/// Sessions are per-instance: deployments route all participants of one
/// call room to the same gateway instance.
pub struct SignalingRelay {
    sessions: DashMap<RoomId, SignalingSession>,
    registry: Arc<ConnectionRegistry>,
    participant_cap: usize,
    idle_deadline: Duration,
}

impl SignalingRelay {
    pub fn new(registry: Arc<ConnectionRegistry>, participant_cap: usize, idle_deadline: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            registry,
            participant_cap,
            idle_deadline,
        }
    }

    /// Create the session for a call room if none exists; returns the
    /// current participant set either way.
    pub fn start_session(&self, room: RoomId) -> Result<Vec<UserId>> {
        if !room.is_call() {
            return Err(GatewayError::Validation(
                "signaling requires a call room".into(),
            ));
        }
        let session = self.sessions.entry(room).or_insert_with(|| SignalingSession {
            participants: HashMap::new(),
            last_activity: Instant::now(),
        });
        Ok(session.participants.keys().copied().collect())
    }

    pub fn join(&self, user_id: UserId, connection_id: ConnectionId, room: RoomId) -> Result<()> {
        if !room.is_call() {
            return Err(GatewayError::Validation(
                "signaling requires a call room".into(),
            ));
        }
        let mut session = self
            .sessions
            .entry(room.clone())
            .or_insert_with(|| SignalingSession {
                participants: HashMap::new(),
                last_activity: Instant::now(),
            });
        if session.participants.len() >= self.participant_cap
            && !session.participants.contains_key(&user_id)
        {
            return Err(GatewayError::RoomFull);
        }
        session.participants.insert(user_id, connection_id);
        session.last_activity = Instant::now();
        tracing::debug!(room = %room, user_id, "signaling participant joined");
        Ok(())
    }

    /// Forward one signaling payload. Both ends must currently be
    /// participants; a live target gets it immediately, a vanished one
    /// loses it silently (its disconnect path is already in flight).
    pub fn relay(
        &self,
        from_user: UserId,
        to_user: UserId,
        room: &RoomId,
        kind: SignalKind,
        payload: serde_json::Value,
    ) -> Result<()> {
        let mut session = self.sessions.get_mut(room).ok_or(GatewayError::NotFound)?;
        if !session.participants.contains_key(&from_user) {
            return Err(GatewayError::NotFound);
        }
        let Some(&target) = session.participants.get(&to_user) else {
            return Err(GatewayError::NotFound);
        };
        session.last_activity = Instant::now();
        drop(session);
        self.registry.send(
            target,
            PushEvent {
                event_type: EVENT_CALL_SIGNAL,
                payload: json!({
                    "call_room_id": room,
                    "from_user_id": from_user,
                    "kind": kind,
                    "payload": payload,
                }),
            },
        );
        Ok(())
    }

    /// Remove a participant; notifies the remainder and tears down the
    /// session once it empties. Idempotent.
    pub fn leave(&self, user_id: UserId, room: &RoomId) {
        let Some(mut session) = self.sessions.get_mut(room) else {
            return;
        };
        if session.participants.remove(&user_id).is_none() {
            return;
        }
        session.last_activity = Instant::now();
        let remaining: Vec<ConnectionId> = session.participants.values().copied().collect();
        let emptied = remaining.is_empty();
        drop(session);

        for connection in remaining {
            self.registry.send(
                connection,
                PushEvent {
                    event_type: EVENT_CALL_MEMBER_LEFT,
                    payload: json!({ "call_room_id": room, "user_id": user_id }),
                },
            );
        }
        if emptied {
            self.sessions
                .remove_if(room, |_, session| session.participants.is_empty());
            tracing::debug!(room = %room, "signaling session torn down");
        }
    }

    /// Disconnect cascade: drop the participant everywhere this connection
    /// was their signaling path.
    pub fn remove_connection(&self, connection_id: ConnectionId, user_id: UserId) {
        let affected: Vec<RoomId> = self
            .sessions
            .iter()
            .filter(|entry| entry.participants.get(&user_id) == Some(&connection_id))
            .map(|entry| entry.key().clone())
            .collect();
        for room in affected {
            self.leave(user_id, &room);
        }
    }

    /// Reclaim sessions idle past the deadline. Covers both empty sessions
    /// left behind by abrupt disconnects and setup state for calls whose
    /// media path has long been established.
    pub fn sweep_idle(&self) -> Vec<RoomId> {
        let now = Instant::now();
        let mut reclaimed = Vec::new();
        self.sessions.retain(|room, session| {
            if now < session.last_activity + self.idle_deadline {
                return true;
            }
            reclaimed.push(room.clone());
            false
        });
        if !reclaimed.is_empty() {
            tracing::debug!(count = reclaimed.len(), "idle signaling sessions reclaimed");
        }
        reclaimed
    }
}
