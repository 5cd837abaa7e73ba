use thiserror::Error;

/// Error taxonomy surfaced to gateway callers. Every variant maps to a
/// stable wire code; none of them is ever delivered to a connection other
/// than the one whose action produced it.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Handshake rejected; the connection is never admitted.
    #[error("unauthenticated")]
    Unauthenticated,
    /// Action denied for this caller.
    #[error("forbidden")]
    Forbidden,
    /// Malformed or oversized payload, rejected locally.
    #[error("validation: {0}")]
    Validation(String),
    /// Room, session or message absent.
    #[error("not found")]
    NotFound,
    /// Call participant cap exceeded.
    #[error("call room is full")]
    RoomFull,
    /// Cluster publish failed after bounded retries. Local delivery has
    /// already happened by the time this is raised, so it only risks
    /// cross-instance visibility, never loss of the local copy.
    #[error("cluster publish failed: {0}")]
    Cluster(String),
    /// Persistence refused the record; the send is aborted and nothing
    /// is delivered. Clients may resubmit with the same idempotency key.
    #[error("store error: {0}")]
    Store(String),
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Unauthenticated => "AUTH",
            GatewayError::Forbidden => "PERMISSION",
            GatewayError::Validation(_) => "VALIDATION",
            GatewayError::NotFound => "NOT_FOUND",
            GatewayError::RoomFull => "ROOM_FULL",
            GatewayError::Cluster(_) => "CLUSTER_TRANSIENT",
            GatewayError::Store(_) => "STORE",
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
