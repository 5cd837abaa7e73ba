use anyhow::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

fn harden_secret_file_permissions(path: &str) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub gateway: GatewaySection,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ServerConfig {
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".into(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AuthConfig {
    /// Shared secret for gateway token validation. Tokens themselves are
    /// issued by the platform's auth service.
    pub jwt_secret: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: generate_random_hex(64),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct GatewaySection {
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    /// Idempotency window for message sends.
    #[serde(default = "default_dedup_window_seconds")]
    pub dedup_window_seconds: u64,
    #[serde(default = "default_presence_ttl_seconds")]
    pub presence_ttl_seconds: u64,
    #[serde(default = "default_typing_clear_seconds")]
    pub typing_clear_seconds: u64,
    #[serde(default = "default_call_participant_cap")]
    pub call_participant_cap: usize,
    #[serde(default = "default_signaling_idle_seconds")]
    pub signaling_idle_seconds: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_connections_per_user")]
    pub max_connections_per_user: usize,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_identify_timeout_seconds")]
    pub identify_timeout_seconds: u64,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            max_payload_bytes: default_max_payload_bytes(),
            dedup_window_seconds: default_dedup_window_seconds(),
            presence_ttl_seconds: default_presence_ttl_seconds(),
            typing_clear_seconds: default_typing_clear_seconds(),
            call_participant_cap: default_call_participant_cap(),
            signaling_idle_seconds: default_signaling_idle_seconds(),
            max_connections: default_max_connections(),
            max_connections_per_user: default_max_connections_per_user(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            identify_timeout_seconds: default_identify_timeout_seconds(),
        }
    }
}

impl GatewaySection {
    pub fn to_gateway_config(&self) -> corvid_core::GatewayConfig {
        corvid_core::GatewayConfig {
            max_payload_bytes: self.max_payload_bytes,
            dedup_window: Duration::from_secs(self.dedup_window_seconds),
            dedup_max_entries: 100_000,
            presence_ttl: Duration::from_secs(self.presence_ttl_seconds),
            typing_clear_after: Duration::from_secs(self.typing_clear_seconds),
            call_participant_cap: self.call_participant_cap,
            signaling_idle_deadline: Duration::from_secs(self.signaling_idle_seconds),
            max_connections: self.max_connections,
            max_connections_per_user: self.max_connections_per_user,
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
            identify_timeout: Duration::from_secs(self.identify_timeout_seconds),
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Generate a cryptographically random hex string of the given length.
fn generate_random_hex(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..16u8);
            char::from(if idx < 10 {
                b'0' + idx
            } else {
                b'a' + idx - 10
            })
        })
        .collect()
}

fn default_max_payload_bytes() -> usize {
    4000
}
fn default_dedup_window_seconds() -> u64 {
    120
}
fn default_presence_ttl_seconds() -> u64 {
    30
}
fn default_typing_clear_seconds() -> u64 {
    8
}
fn default_call_participant_cap() -> usize {
    8
}
fn default_signaling_idle_seconds() -> u64 {
    60
}
fn default_max_connections() -> usize {
    2_000
}
fn default_max_connections_per_user() -> usize {
    5
}
fn default_heartbeat_interval_ms() -> u64 {
    41_250
}
fn default_heartbeat_timeout_ms() -> u64 {
    90_000
}
fn default_identify_timeout_seconds() -> u64 {
    30
}

fn looks_like_placeholder_secret(raw: &str) -> bool {
    let normalized = raw.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        return true;
    }
    normalized.contains("change_me")
        || normalized.contains("replace_me")
        || normalized.starts_with("example")
        || normalized == "devsecret"
        || normalized == "secret"
}

fn validate_secret_configuration(config: &Config) -> Result<()> {
    let jwt_secret = config.auth.jwt_secret.trim();
    if jwt_secret.len() < 32 || looks_like_placeholder_secret(jwt_secret) {
        anyhow::bail!(
            "Invalid auth.jwt_secret: use a strong random secret (at least 32 characters) and never leave placeholder values"
        );
    }
    Ok(())
}

/// Generate a commented config file template with the given values filled in.
fn generate_config_template(config: &Config) -> String {
    format!(
        r#"# Corvid Gateway Configuration
# Generated automatically on first run. Edit as needed.

[server]
bind_address = "{bind_address}"

[auth]
# Must match the secret the platform's auth service signs tokens with.
jwt_secret = "{jwt_secret}"

[gateway]
# Hard cap on message payload bytes.
max_payload_bytes = {max_payload_bytes}
# How long a (room, idempotency key) pair absorbs client retries.
dedup_window_seconds = {dedup_window_seconds}
# Presence entries expire without a heartbeat renewal inside this window.
presence_ttl_seconds = {presence_ttl_seconds}
# Typing indicators auto-clear after this much inactivity.
typing_clear_seconds = {typing_clear_seconds}
# Maximum participants per call room.
call_participant_cap = {call_participant_cap}
# Signaling sessions idle past this deadline are reclaimed.
signaling_idle_seconds = {signaling_idle_seconds}
# Connection capacity.
max_connections = {max_connections}
max_connections_per_user = {max_connections_per_user}
# Client heartbeat cadence and server-side timeout.
heartbeat_interval_ms = {heartbeat_interval_ms}
heartbeat_timeout_ms = {heartbeat_timeout_ms}
identify_timeout_seconds = {identify_timeout_seconds}
"#,
        bind_address = config.server.bind_address,
        jwt_secret = config.auth.jwt_secret,
        max_payload_bytes = config.gateway.max_payload_bytes,
        dedup_window_seconds = config.gateway.dedup_window_seconds,
        presence_ttl_seconds = config.gateway.presence_ttl_seconds,
        typing_clear_seconds = config.gateway.typing_clear_seconds,
        call_participant_cap = config.gateway.call_participant_cap,
        signaling_idle_seconds = config.gateway.signaling_idle_seconds,
        max_connections = config.gateway.max_connections,
        max_connections_per_user = config.gateway.max_connections_per_user,
        heartbeat_interval_ms = config.gateway.heartbeat_interval_ms,
        heartbeat_timeout_ms = config.gateway.heartbeat_timeout_ms,
        identify_timeout_seconds = config.gateway.identify_timeout_seconds,
    )
}

// ── Config Loading ───────────────────────────────────────────────────────────

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let mut config = if std::path::Path::new(path).exists() {
            let content = fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            tracing::info!("Config file not found at '{}', generating defaults...", path);
            let config = Config::default();

            // Ensure parent directory exists
            if let Some(parent) = std::path::Path::new(path).parent() {
                fs::create_dir_all(parent)?;
            }

            let template = generate_config_template(&config);
            fs::write(path, &template)?;
            let _ = harden_secret_file_permissions(path);
            tracing::info!("Generated default config at '{}'", path);
            config
        };
        let _ = harden_secret_file_permissions(path);

        // Environment variable overrides
        if let Ok(value) = std::env::var("CORVID_BIND_ADDRESS") {
            config.server.bind_address = value;
        }
        if let Ok(value) = std::env::var("CORVID_JWT_SECRET") {
            config.auth.jwt_secret = value;
        }
        if let Ok(value) = std::env::var("CORVID_GATEWAY_MAX_PAYLOAD_BYTES") {
            if let Ok(parsed) = value.parse::<usize>() {
                config.gateway.max_payload_bytes = parsed;
            }
        }
        if let Ok(value) = std::env::var("CORVID_GATEWAY_DEDUP_WINDOW_SECONDS") {
            if let Ok(parsed) = value.parse::<u64>() {
                config.gateway.dedup_window_seconds = parsed.max(1);
            }
        }
        if let Ok(value) = std::env::var("CORVID_GATEWAY_PRESENCE_TTL_SECONDS") {
            if let Ok(parsed) = value.parse::<u64>() {
                config.gateway.presence_ttl_seconds = parsed.max(1);
            }
        }
        if let Ok(value) = std::env::var("CORVID_GATEWAY_TYPING_CLEAR_SECONDS") {
            if let Ok(parsed) = value.parse::<u64>() {
                config.gateway.typing_clear_seconds = parsed.max(1);
            }
        }
        if let Ok(value) = std::env::var("CORVID_GATEWAY_CALL_PARTICIPANT_CAP") {
            if let Ok(parsed) = value.parse::<usize>() {
                config.gateway.call_participant_cap = parsed.max(2);
            }
        }
        if let Ok(value) = std::env::var("CORVID_GATEWAY_SIGNALING_IDLE_SECONDS") {
            if let Ok(parsed) = value.parse::<u64>() {
                config.gateway.signaling_idle_seconds = parsed.max(1);
            }
        }
        if let Ok(value) = std::env::var("CORVID_GATEWAY_MAX_CONNECTIONS") {
            if let Ok(parsed) = value.parse::<usize>() {
                config.gateway.max_connections = parsed.max(1);
            }
        }
        if let Ok(value) = std::env::var("CORVID_GATEWAY_MAX_CONNECTIONS_PER_USER") {
            if let Ok(parsed) = value.parse::<usize>() {
                config.gateway.max_connections_per_user = parsed.max(1);
            }
        }
        if let Ok(value) = std::env::var("CORVID_GATEWAY_HEARTBEAT_TIMEOUT_MS") {
            if let Ok(parsed) = value.parse::<u64>() {
                config.gateway.heartbeat_timeout_ms = parsed.max(1_000);
            }
        }

        validate_secret_configuration(&config)?;
        Ok(config)
    }
}
