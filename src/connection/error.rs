//! Connection error types

use std::time::Duration;
use thiserror::Error;

/// Errors raised by the connection manager and its transports
///
/// `Clone` so one in-flight connect outcome can be handed to every caller
/// that coalesced onto it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    /// `send` was called while not connected; the message was dropped
    #[error("Not connected")]
    NotConnected,

    /// The manager was destroyed
    #[error("Connection manager destroyed")]
    Destroyed,

    /// The transport did not open within the connect timeout
    #[error("Connect timed out after {0:?}")]
    Timeout(Duration),

    /// The endpoint URL or handshake headers were rejected before connecting
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// The transport reported a failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// The connection closed with a non-normal code
    #[error("Connection closed abnormally (code {code:?}): {reason}")]
    Closed { code: Option<u16>, reason: String },

    /// Automatic reconnection gave up
    #[error("Reconnect attempts exhausted after {0} attempts")]
    ReconnectExhausted(u32),

    /// The message could not be serialized
    #[error("Encode error: {0}")]
    Encode(String),
}

impl From<serde_json::Error> for ConnectionError {
    fn from(err: serde_json::Error) -> Self {
        ConnectionError::Encode(err.to_string())
    }
}

/// Result type alias for connection operations
pub type ConnectionResult<T> = Result<T, ConnectionError>;
