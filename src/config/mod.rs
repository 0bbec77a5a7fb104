//! Configuration Module
//!
//! TOML configuration for the DriftMQ engine with support for:
//! - Logging level
//! - Queue limits
//! - Session parameters
//! - MQTT feature flags advertised in CONNACK
//! - Persistence
//! - Environment variable overrides (DRIFTMQ__* prefix)

use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use persistence::{BackendType, PersistenceConfig};

mod persistence;


const ENV_PATTERN: &str = r"\$\{([^}:]+)(?::-([^}]*))?\}";

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(ENV_PATTERN).map_err(|e| ConfigError::Validation(e.to_string()))?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .to_string())
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub limits: LimitsConfig,
    pub session: SessionConfig,
    pub mqtt: MqttConfig,
    pub persistence: PersistenceConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Per-session resource limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum queued messages per session; the oldest is dropped when full
    #[serde(default = "default_max_queued_messages")]
    pub max_queued_messages: usize,
    /// Maximum packet size advertised in CONNACK (0 = not advertised)
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: u32,
    /// Maximum topic levels accepted in names and filters (0 = unlimited)
    pub max_topic_levels: usize,
}

fn default_max_queued_messages() -> usize {
    1000
}
fn default_max_packet_size() -> u32 {
    1024 * 1024
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_queued_messages: default_max_queued_messages(),
            max_packet_size: default_max_packet_size(),
            max_topic_levels: 0,
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How often expired sessions and retained messages are swept
    #[serde(default = "default_expiry_check_interval", with = "humantime_serde")]
    pub expiry_check_interval: Duration,
    /// Upper bound on the session expiry interval a client may request
    /// (u32::MAX = never expire)
    #[serde(default = "default_max_session_expiry")]
    pub max_session_expiry: u32,
    /// Topic Alias Maximum advertised to clients (0 = aliases disabled)
    #[serde(default = "default_topic_alias_maximum")]
    pub topic_alias_maximum: u16,
    /// Server Keep Alive sent in CONNACK (0 = accept the client's value)
    pub server_keep_alive: u16,
}

fn default_expiry_check_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_max_session_expiry() -> u32 {
    u32::MAX
}
fn default_topic_alias_maximum() -> u16 {
    16
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            expiry_check_interval: default_expiry_check_interval(),
            max_session_expiry: default_max_session_expiry(),
            topic_alias_maximum: default_topic_alias_maximum(),
            server_keep_alive: 0,
        }
    }
}

/// MQTT feature configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Maximum QoS level (0, 1, or 2)
    #[serde(default = "default_max_qos")]
    pub max_qos: u8,
    /// Whether retained messages are available
    #[serde(default = "default_true")]
    pub retain_available: bool,
    /// Whether wildcard subscriptions are available
    #[serde(default = "default_true")]
    pub wildcard_subscriptions: bool,
    /// Whether subscription identifiers are available
    #[serde(default = "default_true")]
    pub subscription_identifiers: bool,
    /// Whether shared subscriptions are available
    #[serde(default = "default_true")]
    pub shared_subscriptions: bool,
    /// Server Receive Maximum: unreleased inbound QoS 2 publishes per client
    #[serde(default = "default_receive_maximum")]
    pub receive_maximum: u16,
    /// Send DISCONNECT 0x87 after refusing an unauthorized publish
    pub disconnect_on_unauthorized_publish: bool,
    /// Refuse publishes that declare a UTF-8 payload but carry invalid UTF-8
    #[serde(default = "default_true")]
    pub validate_payload_format: bool,
    /// Subscribe-time retained replay always carries retain=1, whatever
    /// the subscription's Retain As Published option
    pub replay_keeps_retain_flag: bool,
}

fn default_max_qos() -> u8 {
    2
}
fn default_true() -> bool {
    true
}
fn default_receive_maximum() -> u16 {
    65535
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            max_qos: default_max_qos(),
            retain_available: true,
            wildcard_subscriptions: true,
            subscription_identifiers: true,
            shared_subscriptions: true,
            receive_maximum: default_receive_maximum(),
            disconnect_on_unauthorized_publish: false,
            validate_payload_format: true,
            replay_keeps_retain_flag: false,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `DRIFTMQ__` prefix with double underscores for nesting:
    ///    - `DRIFTMQ__LIMITS__MAX_QUEUED_MESSAGES=50` overrides `limits.max_queued_messages`
    ///    - `DRIFTMQ__MQTT__MAX_QOS=1` overrides `mqtt.max_qos`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("limits.max_queued_messages", 1000)?
            .set_default("limits.max_packet_size", 1024 * 1024)?
            .set_default("limits.max_topic_levels", 0)?
            .set_default("session.expiry_check_interval", "1s")?
            .set_default("session.max_session_expiry", i64::from(u32::MAX))?
            .set_default("session.topic_alias_maximum", 16)?
            .set_default("session.server_keep_alive", 0)?
            .set_default("mqtt.max_qos", 2)?
            .set_default("mqtt.retain_available", true)?
            .set_default("mqtt.wildcard_subscriptions", true)?
            .set_default("mqtt.subscription_identifiers", true)?
            .set_default("mqtt.shared_subscriptions", true)?
            .set_default("mqtt.receive_maximum", 65535)?
            .set_default("mqtt.disconnect_on_unauthorized_publish", false)?
            .set_default("mqtt.validate_payload_format", true)?
            .set_default("mqtt.replay_keeps_retain_flag", false)?;

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content)?;
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("DRIFTMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.max_qos > 2 {
            return Err(ConfigError::Validation(
                "max_qos must be 0, 1, or 2".to_string(),
            ));
        }
        if self.mqtt.receive_maximum == 0 {
            return Err(ConfigError::Validation(
                "receive_maximum must be greater than 0".to_string(),
            ));
        }
        if self.session.expiry_check_interval.is_zero() {
            return Err(ConfigError::Validation(
                "expiry_check_interval must be greater than 0".to_string(),
            ));
        }
        if self.persistence.enabled {
            if self.persistence.path.as_os_str().is_empty() {
                return Err(ConfigError::Validation(
                    "persistence.path is required when persistence is enabled".to_string(),
                ));
            }
            if self.persistence.flush_interval.is_zero() {
                return Err(ConfigError::Validation(
                    "persistence.flush_interval must be greater than 0".to_string(),
                ));
            }
        }
        Ok(())
    }
}
