use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::room::RoomId;

/// What a fan-out record does to the room's message stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageOp {
    Create,
    Edit,
    Delete,
}

/// A durably accepted message operation, as delivered to room members.
/// `sequence` is strictly increasing per room with no gaps; edits and
/// deletes consume a sequence number of their own so members can order
/// them against the creates they refer to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutMessage {
    pub id: String,
    pub room: RoomId,
    pub sender_id: i64,
    pub op: MessageOp,
    pub payload: String,
    pub sequence: u64,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}
