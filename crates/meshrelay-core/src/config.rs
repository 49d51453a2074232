//! Typed relay configuration
//!
//! The configuration is parsed once at startup from TOML, validated with
//! [`RelayConfig::validate`], and then passed around behind an `Arc`.
//! Durations use humantime notation (`"30s"`, `"5m"`).
//!
//! ```toml
//! [radio]
//! connection_type = "tcp"
//! host = "meshtastic.local"
//! meshnet_name = "HomeMesh"
//!
//! [chat]
//! homeserver = "https://matrix.example.org"
//! access_token = "syt_..."
//!
//! [[rooms]]
//! id = "!abc123:example.org"
//! radio_channel = 0
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Default TCP port exposed by networked radios
pub const DEFAULT_TCP_PORT: u16 = 4403;

/// Default connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default cap on consecutive timeout failures, even with unlimited retries
pub const DEFAULT_TIMEOUT_FAST_FAIL: u32 = 5;

/// Default first delay of the reconnect loop
pub const DEFAULT_RECONNECT_FLOOR: Duration = Duration::from_secs(10);

/// Default number of message mappings kept
pub const DEFAULT_MSGS_TO_KEEP: i64 = 500;

/// Default radio→chat prefix
pub const DEFAULT_RADIO_PREFIX: &str = "{short}[{mesh}]: ";

/// Default chat→radio prefix
pub const DEFAULT_CHAT_PREFIX: &str = "{display5}[M]: ";

/// Top-level relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Radio transport and relay behaviour
    pub radio: RadioConfig,

    /// Chat homeserver session
    pub chat: ChatConfig,

    /// Channel ↔ room bindings
    #[serde(default)]
    pub rooms: Vec<ChannelBinding>,

    /// Reaction/reply bridging policy
    #[serde(default)]
    pub message_interactions: InteractionConfig,

    /// Identity store settings
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Physical transport used to reach the radio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// USB/UART serial port
    Serial,
    /// Bluetooth Low Energy
    Ble,
    /// TCP socket to a networked radio
    Tcp,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Serial => write!(f, "serial"),
            Transport::Ble => write!(f, "ble"),
            Transport::Tcp => write!(f, "tcp"),
        }
    }
}

/// Radio-side configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadioConfig {
    /// Which transport to open
    pub connection_type: Transport,

    /// Serial device path (serial transport)
    #[serde(default)]
    pub serial_port: Option<PathBuf>,

    /// BLE MAC address or device name (ble transport)
    #[serde(default)]
    pub ble_address: Option<String>,

    /// Host name or IP (tcp transport)
    #[serde(default)]
    pub host: Option<String>,

    /// TCP port (tcp transport)
    #[serde(default = "default_tcp_port")]
    pub port: u16,

    /// Name of the local mesh, used for loopback detection and labels
    pub meshnet_name: String,

    /// Whether chat messages are broadcast onto the radio mesh
    #[serde(default = "default_true")]
    pub broadcast_enabled: bool,

    /// Connect attempt cap (0 = unlimited)
    #[serde(default)]
    pub retries: u32,

    /// Per-attempt connect timeout
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub timeout: Duration,

    /// Cap on consecutive timeout failures, applied even when `retries` is 0
    #[serde(default = "default_timeout_fast_fail")]
    pub timeout_fast_fail: u32,

    /// First delay of the reconnect loop after a connection loss
    #[serde(with = "humantime_serde", default = "default_reconnect_floor")]
    pub reconnect_floor: Duration,

    /// Periodic link probing
    #[serde(default)]
    pub health_check: HealthCheckConfig,

    /// Upper bound on waiting for plugins to claim a message
    #[serde(with = "humantime_serde", default = "default_plugin_timeout")]
    pub plugin_timeout: Duration,

    /// Whether radio→chat messages get a sender prefix
    #[serde(default = "default_true")]
    pub prefix_enabled: bool,

    /// Prefix template (`{long}`, `{long5}`, `{short}`, `{mesh}`, `{mesh5}`)
    #[serde(default = "default_radio_prefix")]
    pub prefix_format: String,
}

impl RadioConfig {
    /// Human-readable address of the configured transport
    pub fn address(&self) -> String {
        match self.connection_type {
            Transport::Serial => self
                .serial_port
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            Transport::Ble => self.ble_address.clone().unwrap_or_default(),
            Transport::Tcp => format!("{}:{}", self.host.as_deref().unwrap_or(""), self.port),
        }
    }
}

/// Health check settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Enable periodic probing (never runs for BLE)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Interval between probes
    #[serde(with = "humantime_serde", default = "default_heartbeat_interval")]
    pub heartbeat_interval: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            heartbeat_interval: default_heartbeat_interval(),
        }
    }
}

/// Chat homeserver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Homeserver base URL
    pub homeserver: String,

    /// Access token of the relay account
    pub access_token: String,

    /// Relay account user id; learned via whoami when absent
    #[serde(default)]
    pub user_id: Option<String>,

    /// Whether chat→radio messages get a sender prefix
    #[serde(default = "default_true")]
    pub prefix_enabled: bool,

    /// Prefix template (`{display}`, `{display5}`, `{user}`)
    #[serde(default = "default_chat_prefix")]
    pub prefix_format: String,

    /// Long-poll timeout passed to the sync endpoint
    #[serde(with = "humantime_serde", default = "default_sync_timeout")]
    pub sync_timeout: Duration,
}

/// Static binding between a radio channel and a chat room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelBinding {
    /// Chat room id (or alias before joining)
    pub id: String,

    /// Radio channel index
    pub radio_channel: u32,
}

/// Reaction and reply bridging policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionConfig {
    /// Bridge reactions in both directions
    #[serde(default)]
    pub reactions: bool,

    /// Bridge replies in both directions
    #[serde(default)]
    pub replies: bool,
}

impl InteractionConfig {
    /// Message mappings are only written when some interaction is bridged
    pub fn storage_enabled(&self) -> bool {
        self.reactions || self.replies
    }
}

/// Identity store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file path
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    /// Retention cap for message mappings (<= 0 disables pruning)
    #[serde(default = "default_msgs_to_keep")]
    pub msgs_to_keep: i64,

    /// Clear all mappings at startup
    #[serde(default)]
    pub wipe_on_restart: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            msgs_to_keep: DEFAULT_MSGS_TO_KEEP,
            wipe_on_restart: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive (overridden by `RUST_LOG`)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_tcp_port() -> u16 {
    DEFAULT_TCP_PORT
}

fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}

fn default_timeout_fast_fail() -> u32 {
    DEFAULT_TIMEOUT_FAST_FAIL
}

fn default_reconnect_floor() -> Duration {
    DEFAULT_RECONNECT_FLOOR
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_plugin_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_sync_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_radio_prefix() -> String {
    DEFAULT_RADIO_PREFIX.to_string()
}

fn default_chat_prefix() -> String {
    DEFAULT_CHAT_PREFIX.to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("meshrelay.sqlite")
}

fn default_msgs_to_keep() -> i64 {
    DEFAULT_MSGS_TO_KEEP
}

fn default_log_level() -> String {
    "info".to_string()
}

impl RelayConfig {
    /// Read, parse and validate a TOML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml_str(&contents)?;
        tracing::info!(path = %path.display(), rooms = config.rooms.len(), "Loaded relay configuration");
        Ok(config)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: RelayConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        let radio = &self.radio;
        match radio.connection_type {
            Transport::Serial if radio.serial_port.is_none() => {
                return Err(ConfigError::Missing("radio.serial_port".into()));
            }
            Transport::Ble if radio.ble_address.as_deref().map_or(true, str::is_empty) => {
                return Err(ConfigError::Missing("radio.ble_address".into()));
            }
            Transport::Tcp if radio.host.as_deref().map_or(true, str::is_empty) => {
                return Err(ConfigError::Missing("radio.host".into()));
            }
            _ => {}
        }

        if radio.meshnet_name.trim().is_empty() {
            return Err(invalid("radio.meshnet_name", "must not be empty"));
        }
        if radio.timeout.is_zero() {
            return Err(invalid("radio.timeout", "must be non-zero"));
        }
        if radio.reconnect_floor.is_zero() {
            return Err(invalid("radio.reconnect_floor", "must be non-zero"));
        }
        if radio.health_check.heartbeat_interval.is_zero() {
            return Err(invalid("radio.health_check.heartbeat_interval", "must be non-zero"));
        }

        let homeserver = &self.chat.homeserver;
        if !(homeserver.starts_with("https://") || homeserver.starts_with("http://")) {
            return Err(invalid("chat.homeserver", "must be an http(s) URL"));
        }
        if self.chat.access_token.is_empty() {
            return Err(ConfigError::Missing("chat.access_token".into()));
        }

        if self.rooms.is_empty() {
            return Err(ConfigError::Missing("rooms".into()));
        }
        for room in &self.rooms {
            if !(room.id.starts_with('!') || room.id.starts_with('#')) {
                return Err(invalid(
                    "rooms.id",
                    &format!("'{}' is neither a room id nor an alias", room.id),
                ));
            }
        }

        Ok(())
    }

    /// Rooms bound to a radio channel
    pub fn rooms_for_channel(&self, channel: u32) -> impl Iterator<Item = &ChannelBinding> {
        self.rooms.iter().filter(move |b| b.radio_channel == channel)
    }

    /// Binding for a chat room
    pub fn binding_for_room(&self, room_id: &str) -> Option<&ChannelBinding> {
        self.rooms.iter().find(|b| b.id == room_id)
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

// Helper module for Duration serialization
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        s.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
