use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Idle,
    Offline,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Idle => "idle",
            PresenceStatus::Offline => "offline",
        }
    }

    /// Lenient wire parsing: unknown or missing statuses count as online,
    /// matching what clients send when they first connect.
    pub fn normalize(raw: Option<&str>) -> PresenceStatus {
        match raw.unwrap_or("online") {
            "idle" => PresenceStatus::Idle,
            "offline" => PresenceStatus::Offline,
            _ => PresenceStatus::Online,
        }
    }
}

/// Wire payload for PRESENCE_CHANGED dispatches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub user_id: i64,
    pub status: PresenceStatus,
}
