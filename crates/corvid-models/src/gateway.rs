use serde::{Deserialize, Serialize};

// Client -> Server opcodes
pub const OP_HEARTBEAT: u8 = 1;
pub const OP_IDENTIFY: u8 = 2;
pub const OP_PRESENCE_HEARTBEAT: u8 = 3;
pub const OP_CHANNEL_JOIN: u8 = 4;
pub const OP_CHANNEL_LEAVE: u8 = 5;
pub const OP_MESSAGE_SEND: u8 = 6;
pub const OP_MESSAGE_EDIT: u8 = 7;
pub const OP_MESSAGE_DELETE: u8 = 8;
pub const OP_TYPING_START: u8 = 9;
pub const OP_TYPING_STOP: u8 = 12;
pub const OP_CALL_JOIN: u8 = 13;
pub const OP_CALL_OFFER: u8 = 14;
pub const OP_CALL_ANSWER: u8 = 15;
pub const OP_CALL_ICE: u8 = 16;
pub const OP_CALL_LEAVE: u8 = 17;

// Server -> Client opcodes
pub const OP_DISPATCH: u8 = 0;
pub const OP_HELLO: u8 = 10;
pub const OP_HEARTBEAT_ACK: u8 = 11;
pub const OP_ACK: u8 = 18;
pub const OP_ERROR: u8 = 19;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayMessage {
    pub op: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

// Dispatch event names
pub const EVENT_READY: &str = "READY";

// Room membership
pub const EVENT_MEMBER_JOINED: &str = "MEMBER_JOINED";
pub const EVENT_MEMBER_LEFT: &str = "MEMBER_LEFT";

// Message stream
pub const EVENT_MESSAGE_NEW: &str = "MESSAGE_NEW";
pub const EVENT_MESSAGE_UPDATED: &str = "MESSAGE_UPDATED";
pub const EVENT_MESSAGE_DELETED: &str = "MESSAGE_DELETED";

// Presence and typing
pub const EVENT_PRESENCE_CHANGED: &str = "PRESENCE_CHANGED";
pub const EVENT_TYPING_ACTIVE: &str = "TYPING_ACTIVE";
pub const EVENT_TYPING_INACTIVE: &str = "TYPING_INACTIVE";

// Call signaling
pub const EVENT_CALL_SIGNAL: &str = "CALL_SIGNAL";
pub const EVENT_CALL_MEMBER_LEFT: &str = "CALL_MEMBER_LEFT";

// Flow control
pub const EVENT_RATE_LIMIT: &str = "RATE_LIMIT";
