//! Connection Configuration

use std::time::Duration;

/// WebSocket close code for a normal closure
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close code used when the heartbeat timeout forces a disconnect
pub const HEARTBEAT_TIMEOUT_CLOSURE: u16 = 4000;

/// Runtime configuration for a [`ConnectionManager`](super::ConnectionManager)
///
/// Supplied once at construction and never changed afterwards.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Endpoint URL, with the auth token already embedded
    pub url: String,
    /// Sub-protocols offered during the handshake
    pub protocols: Vec<String>,
    /// How often a ping is sent while connected
    pub heartbeat_interval: Duration,
    /// Close the connection if nothing is received for this long (off when `None`)
    pub heartbeat_timeout: Option<Duration>,
    /// Base delay for reconnect backoff
    pub reconnect_interval: Duration,
    /// Automatic reconnects allowed before giving up
    pub max_reconnect_attempts: u32,
    /// Connect attempts taking longer than this fail
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080/ws".to_string(),
            protocols: Vec::new(),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: None,
            reconnect_interval: Duration::from_secs(5),
            max_reconnect_attempts: 5,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Backoff delay before reconnect attempt `attempt` (1-based)
    ///
    /// `reconnect_interval × 2^(attempt − 1)`, saturating instead of overflowing.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1) - 1;
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.reconnect_interval.saturating_mul(factor)
    }

    /// Append an auth token as the `token` query parameter
    pub fn with_token(mut self, token: &str) -> Self {
        self.url = append_token(&self.url, token);
        self
    }
}

pub(crate) fn append_token(url: &str, token: &str) -> String {
    if token.is_empty() {
        return url.to_string();
    }
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{}{}token={}", url, separator, urlencoding::encode(token))
}
