//! Configuration file parsing and structures.
//!
//! The bridge reads an optional TOML file and then applies environment
//! overrides, so a container deployment can run with no file at all:
//! - `OPCUA_URL`, `OPCUA_ROOT_PATH`
//! - `MQTT_BROKER`, `MQTT_PORT`, `MQTT_USERNAME`, `MQTT_PASSWORD`
//! - `BRIDGE_ID`, `LOG_LEVEL`

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;
use tracing_subscriber::filter::LevelFilter;

/// Top-level configuration structure
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub opcua: OpcUaConfig,
    pub mqtt: MqttConfig,
    pub bridge: BridgeConfig,
}

#[derive(
    Debug, Default, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: LogLevel,

    /// Per-target levels, e.g. `"opcua" = "warn"`
    pub overrides: HashMap<String, LogLevel>,
}

impl LoggingConfig {
    /// Render as an `EnvFilter` directive string, global level first
    pub fn filter_directives(&self) -> String {
        let mut directives = vec![self.level.as_str().to_string()];
        let mut targets: Vec<_> = self.overrides.iter().collect();
        targets.sort();
        for (target, level) in targets {
            directives.push(format!("{}={}", target, level.as_str()));
        }
        directives.join(",")
    }
}

fn default_opcua_url() -> String {
    "opc.tcp://localhost:4840".to_string()
}

fn default_root_path() -> String {
    r#"ns=3;s="SmartHome_Data""#.to_string()
}

fn default_application_name() -> String {
    "opcua-mqtt-homeassistant".to_string()
}

/// Address-space (OPC UA) connection settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OpcUaConfig {
    /// Endpoint URL, e.g. `opc.tcp://192.168.30.4:4840`
    pub url: String,

    /// Node under which every direct child is an entity candidate
    pub root_path: String,

    pub application_name: String,

    /// Retries after the first failed connect attempt
    pub connect_retries: u32,

    /// Fixed delay between connect attempts
    pub connect_retry_delay_ms: u64,

    /// Publishing interval of the shared change subscription
    pub publishing_interval_ms: u64,
}

impl Default for OpcUaConfig {
    fn default() -> Self {
        Self {
            url: default_opcua_url(),
            root_path: default_root_path(),
            application_name: default_application_name(),
            connect_retries: 1,
            connect_retry_delay_ms: 1000,
            publishing_interval_ms: 500,
        }
    }
}

fn default_discovery_prefix() -> String {
    "homeassistant".to_string()
}

/// Message bus (MQTT) connection settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// MQTT broker hostname or IP address
    pub broker: String,

    /// MQTT broker port
    pub port: u16,

    /// A random suffix is appended per process
    pub client_id_prefix: String,

    /// Optional username for authentication
    pub username: Option<String>,

    /// Optional password for authentication
    pub password: Option<String>,

    /// Home Assistant discovery prefix (default: "homeassistant")
    pub discovery_prefix: String,

    pub keep_alive_secs: u64,

    /// Delay before the event loop is polled again after a connection error
    pub reconnect_delay_ms: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: "localhost".to_string(),
            port: 1883,
            client_id_prefix: default_application_name(),
            username: None,
            password: None,
            discovery_prefix: default_discovery_prefix(),
            keep_alive_secs: 30,
            reconnect_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Bridge identifier used in topic names
    pub id: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            id: default_application_name(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().to_path_buf(), e))?;

        toml::from_str(&contents).map_err(ConfigError::Parse)
    }

    /// Load from an optional file, apply process environment overrides and validate
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment-style overrides read through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("OPCUA_URL") {
            self.opcua.url = url;
        }
        if let Some(root_path) = lookup("OPCUA_ROOT_PATH") {
            self.opcua.root_path = root_path;
        }
        if let Some(broker) = lookup("MQTT_BROKER") {
            self.mqtt.broker = broker;
        }
        if let Some(port) = lookup("MQTT_PORT") {
            self.mqtt.port = port.trim().parse().map_err(|_| ConfigError::InvalidOverride {
                var: "MQTT_PORT",
                value: port.clone(),
            })?;
        }
        if let Some(username) = lookup("MQTT_USERNAME") {
            self.mqtt.username = Some(username);
        }
        if let Some(password) = lookup("MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }
        if let Some(id) = lookup("BRIDGE_ID") {
            self.bridge.id = id;
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = level.parse().map_err(|_| ConfigError::InvalidOverride {
                var: "LOG_LEVEL",
                value: level.clone(),
            })?;
        }
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("opcua.url", &self.opcua.url),
            ("opcua.root_path", &self.opcua.root_path),
            ("mqtt.broker", &self.mqtt.broker),
            ("bridge.id", &self.bridge.id),
            ("mqtt.discovery_prefix", &self.mqtt.discovery_prefix),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{} must not be empty", field)));
            }
        }

        // Both end up as single topic levels
        for (field, value) in [
            ("bridge.id", &self.bridge.id),
            ("mqtt.discovery_prefix", &self.mqtt.discovery_prefix),
        ] {
            if value.contains(['+', '#', '/']) {
                return Err(ConfigError::Invalid(format!(
                    "{} '{}' must not contain '+', '#' or '/'",
                    field, value
                )));
            }
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {var}: '{value}'")]
    InvalidOverride { var: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
