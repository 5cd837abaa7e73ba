use corvid_core::registry::{ConnectionId, UserId};

pub struct Session {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub session_id: String,
    /// Per-connection dispatch counter carried in the `s` field of every
    /// dispatch frame. Distinct from the per-room message sequence.
    pub sequence: u64,
}

impl Session {
    pub fn new(connection_id: ConnectionId, user_id: UserId) -> Self {
        Self {
            connection_id,
            user_id,
            session_id: uuid::Uuid::new_v4().to_string(),
            sequence: 0,
        }
    }

    pub fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }
}
