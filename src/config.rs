//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::broadcast::BroadcasterConfig;
use crate::connection::ConnectionConfig;
use crate::router::{RecipientContext, RouterConfig, UserRole};
use crate::service::ServiceOptions;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionSettings,

    #[serde(default)]
    pub router: RouterSettings,

    #[serde(default)]
    pub broadcaster: BroadcasterSettings,

    #[serde(default)]
    pub source: SourceSettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Realtime endpoint configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionSettings {
    #[serde(default = "default_url")]
    pub url: String,

    /// Session token, appended as the `token` query parameter
    pub auth_token: Option<String>,

    #[serde(default)]
    pub protocols: Vec<String>,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Close and reconnect when nothing arrives for this long
    pub heartbeat_timeout_secs: Option<u64>,

    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_ms: u64,

    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_url() -> String {
    "ws://localhost:8080/realtime".to_string()
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_reconnect_interval() -> u64 {
    5000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            url: default_url(),
            auth_token: None,
            protocols: Vec::new(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            heartbeat_timeout_secs: None,
            reconnect_interval_ms: default_reconnect_interval(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl ConnectionSettings {
    /// Validate and convert into the manager's runtime config
    pub fn to_connection_config(&self) -> Result<ConnectionConfig, ConfigError> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(ConfigError::Invalid(format!(
                "connection.url must be a ws:// or wss:// URL, got {:?}",
                self.url
            )));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "connection.heartbeat_interval_secs must be positive".to_string(),
            ));
        }

        let config = ConnectionConfig {
            url: self.url.clone(),
            protocols: self.protocols.clone(),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            heartbeat_timeout: self.heartbeat_timeout_secs.map(Duration::from_secs),
            reconnect_interval: Duration::from_millis(self.reconnect_interval_ms),
            max_reconnect_attempts: self.max_reconnect_attempts,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        };

        Ok(match self.auth_token.as_deref() {
            Some(token) => config.with_token(token),
            None => config,
        })
    }
}

/// Router configuration and the session's recipient context
#[derive(Debug, Clone, Deserialize)]
pub struct RouterSettings {
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Without a user id no context is set and taxonomy events are withheld
    pub user_id: Option<String>,

    #[serde(default = "default_role")]
    pub role: String,

    pub building_ids: Option<Vec<String>>,

    pub permissions: Option<Vec<String>>,
}

fn default_retry_delay() -> u64 {
    1000
}

fn default_role() -> String {
    "worker".to_string()
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            retry_delay_ms: default_retry_delay(),
            user_id: None,
            role: default_role(),
            building_ids: None,
            permissions: None,
        }
    }
}

impl RouterSettings {
    pub fn to_router_config(&self) -> RouterConfig {
        RouterConfig {
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }

    pub fn recipient_context(&self) -> Result<Option<RecipientContext>, ConfigError> {
        let Some(user_id) = self.user_id.as_deref() else {
            return Ok(None);
        };
        let role: UserRole = self
            .role
            .parse()
            .map_err(|e: String| ConfigError::Invalid(format!("router.role: {}", e)))?;

        Ok(Some(RecipientContext {
            user_id: user_id.to_string(),
            user_role: role,
            building_ids: self.building_ids.clone(),
            permissions: self.permissions.clone(),
        }))
    }
}

/// Change broadcaster configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BroadcasterSettings {
    #[serde(default = "default_broadcaster_enabled")]
    pub enabled: bool,

    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    #[serde(default = "default_analytics_every")]
    pub analytics_every_ticks: u32,

    #[serde(default = "default_analytics_window")]
    pub analytics_window_days: i64,

    #[serde(default = "default_completion_lookback")]
    pub completion_lookback_hours: i64,
}

fn default_broadcaster_enabled() -> bool {
    true
}

fn default_tick_interval() -> u64 {
    30
}

fn default_analytics_every() -> u32 {
    10
}

fn default_analytics_window() -> i64 {
    7
}

fn default_completion_lookback() -> i64 {
    24
}

impl Default for BroadcasterSettings {
    fn default() -> Self {
        Self {
            enabled: default_broadcaster_enabled(),
            tick_interval_secs: default_tick_interval(),
            analytics_every_ticks: default_analytics_every(),
            analytics_window_days: default_analytics_window(),
            completion_lookback_hours: default_completion_lookback(),
        }
    }
}

impl BroadcasterSettings {
    pub fn to_broadcaster_config(&self) -> Result<BroadcasterConfig, ConfigError> {
        if self.tick_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "broadcaster.tick_interval_secs must be positive".to_string(),
            ));
        }
        if self.analytics_window_days <= 0 || self.completion_lookback_hours <= 0 {
            return Err(ConfigError::Invalid(
                "broadcaster windows must be positive".to_string(),
            ));
        }

        Ok(BroadcasterConfig {
            tick_interval: Duration::from_secs(self.tick_interval_secs),
            analytics_every_ticks: self.analytics_every_ticks.max(1),
            analytics_window_days: self.analytics_window_days,
            completion_lookback_hours: self.completion_lookback_hours,
        })
    }
}

/// State source configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SourceSettings {
    /// JSON state document re-read every tick
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: String,
}

fn default_snapshot_path() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("fieldsync").join("state.json").to_string_lossy().to_string())
        .unwrap_or_else(|| "./state.json".to_string())
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            snapshot_path: default_snapshot_path(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// `pretty` or `json`
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("fieldsync").join("config.toml")),
            Some(PathBuf::from("/etc/fieldsync/config.toml")),
            Some(PathBuf::from("./fieldsync.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                match Self::load_with_env(path) {
                    Ok(config) => {
                        tracing::info!(path = %path.display(), "Loaded config");
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Failed to load config");
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Everything the realtime service needs, validated
    pub fn service_options(&self) -> Result<ServiceOptions, ConfigError> {
        Ok(ServiceOptions {
            connection: self.connection.to_connection_config()?,
            router: self.router.to_router_config(),
            broadcaster: self.broadcaster.to_broadcaster_config()?,
            broadcaster_enabled: self.broadcaster.enabled,
            context: self.router.recipient_context()?,
        })
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        // Connection overrides
        if let Some(url) = var("FIELDSYNC_URL") {
            self.connection.url = url;
        }
        if let Some(token) = var("FIELDSYNC_TOKEN") {
            self.connection.auth_token = Some(token);
        }

        // Session overrides
        if let Some(user_id) = var("FIELDSYNC_USER_ID") {
            self.router.user_id = Some(user_id);
        }
        if let Some(role) = var("FIELDSYNC_ROLE") {
            self.router.role = role;
        }

        // Source overrides
        if let Some(path) = var("FIELDSYNC_SNAPSHOT") {
            self.source.snapshot_path = path;
        }

        // Logging overrides
        if let Some(level) = var("FIELDSYNC_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("FIELDSYNC_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# fieldsync Configuration
#
# Environment variables override these settings:
# - FIELDSYNC_URL
# - FIELDSYNC_TOKEN
# - FIELDSYNC_USER_ID
# - FIELDSYNC_ROLE
# - FIELDSYNC_SNAPSHOT
# - FIELDSYNC_LOG_LEVEL
# - FIELDSYNC_LOG_FORMAT

[connection]
# Realtime endpoint (ws:// or wss://)
url = "ws://localhost:8080/realtime"

# Session token, sent as the `token` query parameter
# auth_token = ""

# Sub-protocols offered during the handshake
protocols = []

# Ping interval while connected (seconds)
heartbeat_interval_secs = 30

# Reconnect when nothing is received for this long (seconds, off when unset)
# heartbeat_timeout_secs = 90

# Base reconnect delay, doubled per attempt (ms)
reconnect_interval_ms = 5000

# Automatic reconnects before giving up
max_reconnect_attempts = 5

# Connect attempts taking longer than this fail (seconds)
connect_timeout_secs = 10

[router]
# Delay before the single retry of a retryable handler (ms)
retry_delay_ms = 1000

# Recipient context for permission filtering
# user_id = "worker-1"
role = "worker"
# building_ids = ["b1", "b2"]
# permissions = ["events:building_update"]

[broadcaster]
enabled = true

# Change-detection interval (seconds)
tick_interval_secs = 30

# Analytics rollup runs every N ticks
analytics_every_ticks = 10

# Rolling analytics window (days)
analytics_window_days = 7

# Completed tasks newer than this are announced (hours)
completion_lookback_hours = 24

[source]
# JSON state document re-read every tick
snapshot_path = "./state.json"

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty, json
format = "pretty"
"#
    .to_string()
}
