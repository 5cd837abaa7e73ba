use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Namespaced room identifier: `channel:<id>`, `conversation:<id>` or
/// `call:<id>`. Channel and conversation rooms carry a per-room message
/// sequence; call rooms exist only for membership and signaling.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RoomId {
    Channel(i64),
    Conversation(i64),
    Call(i64),
}

impl RoomId {
    pub fn is_sequenced(&self) -> bool {
        !matches!(self, RoomId::Call(_))
    }

    pub fn is_call(&self) -> bool {
        matches!(self, RoomId::Call(_))
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomId::Channel(id) => write!(f, "channel:{id}"),
            RoomId::Conversation(id) => write!(f, "conversation:{id}"),
            RoomId::Call(id) => write!(f, "call:{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseRoomIdError(String);

impl fmt::Display for ParseRoomIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid room id: {}", self.0)
    }
}

impl std::error::Error for ParseRoomIdError {}

impl FromStr for RoomId {
    type Err = ParseRoomIdError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (namespace, id) = raw
            .split_once(':')
            .ok_or_else(|| ParseRoomIdError(raw.to_string()))?;
        let id: i64 = id
            .parse()
            .map_err(|_| ParseRoomIdError(raw.to_string()))?;
        match namespace {
            "channel" => Ok(RoomId::Channel(id)),
            "conversation" => Ok(RoomId::Conversation(id)),
            "call" => Ok(RoomId::Call(id)),
            _ => Err(ParseRoomIdError(raw.to_string())),
        }
    }
}

impl Serialize for RoomId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RoomId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}
