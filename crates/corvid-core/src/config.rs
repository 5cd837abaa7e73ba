use std::time::Duration;

/// Runtime knobs for the gateway core. The server binary builds this from
/// its TOML config; tests construct it directly with shorter windows.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Hard cap on `message:send` payload bytes.
    pub max_payload_bytes: usize,
    /// How long a (room, idempotency key) pair absorbs client retries.
    pub dedup_window: Duration,
    /// Upper bound on remembered idempotency keys.
    pub dedup_max_entries: u64,
    /// Presence entries expire this long after their last heartbeat.
    pub presence_ttl: Duration,
    /// Typing indicators auto-clear after this much inactivity.
    pub typing_clear_after: Duration,
    /// Maximum participants per call room.
    pub call_participant_cap: usize,
    /// Signaling sessions without activity past this deadline are reclaimed.
    pub signaling_idle_deadline: Duration,
    /// Gateway-wide connection cap.
    pub max_connections: usize,
    /// Per-user concurrent connection cap.
    pub max_connections_per_user: usize,
    /// Client heartbeat interval advertised in HELLO.
    pub heartbeat_interval: Duration,
    /// Close the socket when no heartbeat arrives within this window.
    pub heartbeat_timeout: Duration,
    /// How long a fresh socket may take to IDENTIFY.
    pub identify_timeout: Duration,
}

impl GatewayConfig {
    /// The reclamation pass never runs finer than half the TTL window;
    /// expiry itself is checked lazily on every query so the sweep cadence
    /// only bounds memory, not correctness.
    pub fn presence_sweep_interval(&self) -> Duration {
        self.presence_ttl / 2
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: 4000,
            dedup_window: Duration::from_secs(120),
            dedup_max_entries: 100_000,
            presence_ttl: Duration::from_secs(30),
            typing_clear_after: Duration::from_secs(8),
            call_participant_cap: 8,
            signaling_idle_deadline: Duration::from_secs(60),
            max_connections: 2_000,
            max_connections_per_user: 5,
            heartbeat_interval: Duration::from_millis(41_250),
            heartbeat_timeout: Duration::from_secs(90),
            identify_timeout: Duration::from_secs(30),
        }
    }
}
