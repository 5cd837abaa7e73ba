use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use corvid_models::room::RoomId;

use crate::error::{GatewayError, Result};

/// An event published to peer gateway instances. Routing mirrors local
/// dispatch: a room id delivers to the peer's local members of that room,
/// explicit targets deliver per user, and neither means broadcast to every
/// connection (presence changes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    /// Instance that published the event. Subscribers drop their own
    /// events; local delivery happens directly, not through the bus loop.
    pub origin: Uuid,
    pub event_type: String,
    pub room: Option<RoomId>,
    pub target_user_ids: Option<Vec<i64>>,
    pub payload: serde_json::Value,
}

impl BusEvent {
    pub fn to_room(origin: Uuid, event_type: &str, room: RoomId, payload: serde_json::Value) -> Self {
        Self {
            origin,
            event_type: event_type.to_string(),
            room: Some(room),
            target_user_ids: None,
            payload,
        }
    }

    pub fn to_all(origin: Uuid, event_type: &str, payload: serde_json::Value) -> Self {
        Self {
            origin,
            event_type: event_type.to_string(),
            room: None,
            target_user_ids: None,
            payload,
        }
    }
}

/// Cross-instance publish/subscribe. Implementations must deliver every
/// published event to every other subscribing instance at least once;
/// consumers are idempotent (sequence numbers, idempotency keys), so
/// redelivery is safe.
#[async_trait]
pub trait ClusterBus: Send + Sync {
    async fn publish(&self, event: BusEvent) -> Result<()>;
    fn subscribe(&self) -> broadcast::Receiver<BusEvent>;
}

/// In-process bus backed by a tokio broadcast channel. A single instance
/// shares one harmlessly (it drops its own events on receipt); tests wire
/// several gateway instances to one `LoopbackBus` to exercise fleet
/// fan-out.
pub struct LoopbackBus {
    sender: broadcast::Sender<BusEvent>,
}

impl LoopbackBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }
}

impl Default for LoopbackBus {
    fn default() -> Self {
        Self::new(4096)
    }
}

#[async_trait]
impl ClusterBus for LoopbackBus {
    async fn publish(&self, event: BusEvent) -> Result<()> {
        // No subscribers is not a failure: a single-instance deployment
        // has nobody listening.
        let _ = self.sender.send(event);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }
}

/// Publish with bounded exponential backoff. Callers invoke this off the
/// hot path (local delivery has already been dispatched); a final failure
/// is logged as lost cross-instance visibility, never data loss.
pub async fn publish_with_retry(
    bus: &dyn ClusterBus,
    event: BusEvent,
    attempts: u32,
) -> Result<()> {
    let mut delay = std::time::Duration::from_millis(50);
    let mut last = String::new();
    for attempt in 1..=attempts {
        match bus.publish(event.clone()).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                last = err.to_string();
                if attempt < attempts {
                    tracing::warn!(
                        event_type = %event.event_type,
                        attempt,
                        error = %last,
                        "cluster publish failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }
    Err(GatewayError::Cluster(last))
}

/// Publish once, falling back to bounded background retries on transient
/// failure. The first attempt is awaited so a publisher's events keep
/// their order on a healthy bus; the retry path trades ordering for
/// at-least-once delivery, which consumers absorb through sequence
/// numbers and idempotency keys.
pub async fn publish_or_retry(bus: std::sync::Arc<dyn ClusterBus>, event: BusEvent) {
    if let Err(err) = bus.publish(event.clone()).await {
        tracing::warn!(
            error = %err,
            event_type = %event.event_type,
            "cluster publish failed, retrying in background"
        );
        tokio::spawn(async move {
            if let Err(err) = publish_with_retry(bus.as_ref(), event, 3).await {
                tracing::error!(error = %err, "cluster event dropped after retries");
            }
        });
    }
}
