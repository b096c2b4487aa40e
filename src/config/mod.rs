//! Configuration Module
//!
//! Provides TOML-based configuration for SyncMQ with support for:
//! - Local broker connection settings
//! - Acceptor / Initiator peer link roles
//! - Sync policy (topic list, marker key, forward mode)
//! - Environment variable overrides (SYNCMQ_* prefix)

use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
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
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Local broker connection
    pub mqtt: MqttConfig,
    /// Listening peer link role
    pub acceptor: AcceptorConfig,
    /// Dialing peer link role
    pub initiator: InitiatorConfig,
    /// Sync policy
    pub sync: SyncConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// TLS material file paths (PEM format)
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TlsConfig {
    /// Path to CA certificate file
    pub ca_cert: String,

    /// Path to certificate file
    pub cert: String,

    /// Path to private key file
    pub key: String,

    /// Server name for SNI (defaults to the connection host)
    pub server_name: Option<String>,
}

/// Local broker connection settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker host
    pub host: String,

    /// Broker port
    pub port: u16,

    /// Client ID prefix; the process ID is appended to keep reconnecting
    /// instances distinct
    pub client_id: String,

    /// Username for authentication
    pub username: Option<String>,

    /// Password for authentication
    pub password: Option<String>,

    /// TLS configuration; plain TCP when absent
    pub tls: Option<TlsConfig>,

    /// Delay between broker connection attempts
    #[serde(with = "humantime_serde")]
    pub connect_retry_interval: Duration,

    /// Timeout for connect and subscribe round trips
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// MQTT keep alive in seconds
    pub keep_alive: u16,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: "syncmq".to_string(),
            username: None,
            password: None,
            tls: None,
            connect_retry_interval: Duration::from_secs(3),
            timeout: Duration::from_secs(10),
            keep_alive: 60,
        }
    }
}

impl MqttConfig {
    /// Broker address as host:port
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Listening peer link role
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AcceptorConfig {
    /// Whether the acceptor role is active
    pub enabled: bool,

    /// Bind host
    pub host: String,

    /// Bind port
    pub port: u16,

    /// Mutual TLS configuration; plain TCP when absent
    pub tls: Option<TlsConfig>,

    /// Interval between liveness frames on an attached stream
    #[serde(with = "humantime_serde")]
    pub keepalive_interval: Duration,
}

impl Default for AcceptorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "0.0.0.0".to_string(),
            port: 31883,
            tls: None,
            keepalive_interval: Duration::from_secs(30),
        }
    }
}

impl AcceptorConfig {
    /// Listen address as host:port
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Dialing peer link role
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InitiatorConfig {
    /// Whether the initiator role is active
    pub enabled: bool,

    /// Remote acceptor host
    pub host: String,

    /// Remote acceptor port
    pub port: u16,

    /// Mutual TLS configuration; plain TCP when absent
    pub tls: Option<TlsConfig>,

    /// Fixed delay between reconnect attempts; retries continue
    /// indefinitely
    #[serde(with = "humantime_serde")]
    pub reconnect_interval: Duration,

    /// Interval between liveness frames on an attached stream
    #[serde(with = "humantime_serde")]
    pub keepalive_interval: Duration,
}

impl Default for InitiatorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: 31883,
            tls: None,
            reconnect_interval: Duration::from_secs(3),
            keepalive_interval: Duration::from_secs(30),
        }
    }
}

impl InitiatorConfig {
    /// Remote address as host:port
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Which peer link(s) receive locally-originated messages when both roles
/// are enabled on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ForwardMode {
    /// The acceptor wins when both roles are enabled; each message goes to
    /// exactly one link
    #[default]
    AcceptorPriority,
    /// Every enabled link receives every eligible message
    FanOut,
}

/// Sync policy
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Topics to mirror between the two sides
    pub topics: Vec<String>,

    /// Marker key inserted into payloads to detect already-bridged
    /// messages
    pub marker_key: String,

    /// Forwarding target selection when both roles are enabled
    pub forward: ForwardMode,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            topics: Vec::new(),
            marker_key: "___mqtt_sync___".to_string(),
            forward: ForwardMode::AcceptorPriority,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable
    /// substitution, then apply SYNCMQ_* environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Override with environment variables (SYNCMQ__SYNC__MARKER_KEY, etc.)
        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("SYNCMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.marker_key.is_empty() {
            return Err(ConfigError::Validation(
                "sync.marker_key must not be empty".to_string(),
            ));
        }

        // The empty topic is the handshake sentinel and cannot be mirrored
        if self.sync.topics.iter().any(|t| t.is_empty()) {
            return Err(ConfigError::Validation(
                "sync.topics must not contain empty topics".to_string(),
            ));
        }

        if (self.acceptor.enabled || self.initiator.enabled) && self.sync.topics.is_empty() {
            return Err(ConfigError::Validation(
                "sync.topics must list at least one topic when a peer role is enabled".to_string(),
            ));
        }

        Ok(())
    }
}
