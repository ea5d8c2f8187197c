//! Client settings
//!
//! Tunables live in a YAML file; API credentials only ever come from the
//! environment (`API_KEY`, `API_SECRET`, optionally through `.env`).

use serde::{Deserialize, Serialize};
use socketmux::SocketConfig;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use timesync::{ClockSyncConfig, SyncMode, UnsyncedPolicy};
use tracing::info;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load config file: {0}")]
    FileError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Environment variable not found: {0}")]
    EnvVarMissing(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

pub const API_KEY_VAR: &str = "API_KEY";
pub const API_SECRET_VAR: &str = "API_SECRET";

/// API key pair used by the request signer
#[derive(Clone, PartialEq, Eq)]
pub struct ApiCredentials {
    pub api_key: String,
    pub api_secret: String,
}

impl ApiCredentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    /// Read both variables; `None` unless both are set and non-empty
    pub fn from_env() -> Option<Self> {
        let key = std::env::var(API_KEY_VAR).ok().filter(|v| !v.is_empty())?;
        let secret = std::env::var(API_SECRET_VAR).ok().filter(|v| !v.is_empty())?;
        Some(Self::new(key, secret))
    }

    /// Like [`from_env`](Self::from_env) but missing variables are an error
    pub fn require_env() -> Result<Self> {
        for var in [API_KEY_VAR, API_SECRET_VAR] {
            if std::env::var(var).map_or(true, |v| v.is_empty()) {
                return Err(ConfigError::EnvVarMissing(var.to_string()));
            }
        }
        Self::from_env().ok_or_else(|| ConfigError::EnvVarMissing(API_KEY_VAR.to_string()))
    }
}

// Never print the secret
impl fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

/// Main client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    pub streams: StreamsConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub clock: ClockConfig,

    /// From .env (not in YAML)
    #[serde(skip)]
    pub credentials: Option<ApiCredentials>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamsConfig {
    /// Websocket endpoint (ws:// or wss://)
    pub url: String,
    #[serde(default = "default_subscribe_method")]
    pub subscribe_method: String,
    #[serde(default = "default_unsubscribe_method")]
    pub unsubscribe_method: String,
    #[serde(default)]
    pub topics: Vec<String>,
    /// Topics combined into one subscribe request
    #[serde(default = "default_topics_per_request")]
    pub topics_per_request: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub auto_reconnect: bool,
    pub reconnect_interval_ms: u64,
    pub max_reconnect_tries: Option<u32>,
    pub max_resubscribe_tries: Option<u32>,
    pub max_concurrent_resubscriptions: usize,
    pub subscription_combine_target: usize,
    pub max_connections: Option<usize>,
    pub response_timeout_ms: u64,
    pub no_data_timeout_ms: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect_interval_ms: 5_000,
            max_reconnect_tries: None,
            max_resubscribe_tries: Some(5),
            max_concurrent_resubscriptions: 5,
            subscription_combine_target: 10,
            max_connections: None,
            response_timeout_ms: 10_000,
            no_data_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockMode {
    Manual,
    Fast,
    Minute,
    Hourly,
}

impl From<ClockMode> for SyncMode {
    fn from(mode: ClockMode) -> Self {
        match mode {
            ClockMode::Manual => SyncMode::Manual,
            ClockMode::Fast => SyncMode::Fast,
            ClockMode::Minute => SyncMode::Minute,
            ClockMode::Hourly => SyncMode::Hourly,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    pub mode: ClockMode,
    pub initial_delay_ms: u64,
    /// REST endpoint returning the server time
    pub time_url: Option<String>,
    /// Field of the response holding Unix milliseconds, dots for nesting
    pub time_field: String,
    /// Block signed requests until the first sample (otherwise reject them)
    pub wait_for_sync: bool,
    pub max_wait_ms: u64,
    pub timestamp_error_code: Option<i64>,
    /// Fixed offset for manual mode
    pub offset_ms: Option<i64>,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            mode: ClockMode::Minute,
            initial_delay_ms: 0,
            time_url: None,
            time_field: "serverTime".to_string(),
            wait_for_sync: true,
            max_wait_ms: 10_000,
            timestamp_error_code: None,
            offset_ms: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_subscribe_method() -> String {
    "SUBSCRIBE".to_string()
}

fn default_unsubscribe_method() -> String {
    "UNSUBSCRIBE".to_string()
}

fn default_topics_per_request() -> usize {
    1
}

impl ClientSettings {
    /// Load configuration from YAML file and credentials from the environment
    pub fn load(config_path: impl AsRef<Path>) -> Result<Self> {
        let yaml_content = std::fs::read_to_string(config_path)?;
        let mut settings = Self::from_yaml(&yaml_content)?;

        settings.credentials = ApiCredentials::from_env();
        if settings.credentials.is_some() {
            info!("API credentials loaded from environment");
        }

        Ok(settings)
    }

    /// Parse and validate without touching the environment
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let settings: ClientSettings = serde_yaml::from_str(yaml)?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "log_level must be one of: {}",
                valid_levels.join(", ")
            )));
        }

        if !(self.streams.url.starts_with("ws://") || self.streams.url.starts_with("wss://")) {
            return Err(ConfigError::ValidationError(
                "streams.url must start with ws:// or wss://".to_string(),
            ));
        }

        if self.streams.topics_per_request == 0 {
            return Err(ConfigError::ValidationError(
                "streams.topics_per_request must be greater than 0".to_string(),
            ));
        }

        let session = &self.session;
        if session.reconnect_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "session.reconnect_interval_ms must be greater than 0".to_string(),
            ));
        }
        if session.subscription_combine_target == 0 {
            return Err(ConfigError::ValidationError(
                "session.subscription_combine_target must be greater than 0".to_string(),
            ));
        }
        if session.max_concurrent_resubscriptions == 0 {
            return Err(ConfigError::ValidationError(
                "session.max_concurrent_resubscriptions must be greater than 0".to_string(),
            ));
        }
        if session.max_connections == Some(0) {
            return Err(ConfigError::ValidationError(
                "session.max_connections must be greater than 0 when set".to_string(),
            ));
        }

        if self.clock.mode != ClockMode::Manual && self.clock.time_url.is_none() {
            return Err(ConfigError::ValidationError(
                "clock.time_url is required unless clock.mode is manual".to_string(),
            ));
        }

        Ok(())
    }

    pub fn socket_config(&self) -> SocketConfig {
        let session = &self.session;
        SocketConfig::new()
            .auto_reconnect(session.auto_reconnect)
            .reconnect_interval(Duration::from_millis(session.reconnect_interval_ms))
            .max_reconnect_tries(session.max_reconnect_tries)
            .max_resubscribe_tries(session.max_resubscribe_tries)
            .max_concurrent_resubscriptions(session.max_concurrent_resubscriptions)
            .subscription_combine_target(session.subscription_combine_target)
            .max_connections(session.max_connections)
            .response_timeout(Duration::from_millis(session.response_timeout_ms))
            .no_data_timeout(session.no_data_timeout_ms.map(Duration::from_millis))
    }

    pub fn clock_config(&self) -> ClockSyncConfig {
        let policy = if self.clock.wait_for_sync {
            UnsyncedPolicy::Wait
        } else {
            UnsyncedPolicy::Reject
        };
        ClockSyncConfig::new(self.clock.mode.into())
            .initial_delay(Duration::from_millis(self.clock.initial_delay_ms))
            .unsynced_policy(policy)
            .max_wait(Duration::from_millis(self.clock.max_wait_ms))
            .timestamp_error_code(self.clock.timestamp_error_code)
    }

    /// Log configuration summary
    pub fn log(&self) {
        info!("Configuration loaded:");
        info!("  Stream url: {}", self.streams.url);
        info!("  Topics: {}", self.streams.topics.len());
        info!(
            "  Combine target: {} per connection",
            self.session.subscription_combine_target
        );
        info!("  Clock mode: {:?}", self.clock.mode);
        info!(
            "  Credentials: {}",
            if self.credentials.is_some() { "present" } else { "none" }
        );
        info!("  Log level: {}", self.log_level);
    }
}
