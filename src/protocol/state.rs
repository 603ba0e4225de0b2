//! Connection State
//!
//! Observable lifecycle state of the connection manager, published to
//! dashboards through a watch channel.

use serde::Serialize;

/// Lifecycle state of the realtime connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    /// Initial state, and the resting state after a normal close or
    /// after reconnect attempts are exhausted
    Disconnected,
    Connecting,
    Connected,
    /// A reconnect is scheduled
    Reconnecting { attempt: u32 },
    /// Terminal
    Destroyed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting { .. }
        )
    }

    pub fn is_destroyed(&self) -> bool {
        matches!(self, ConnectionState::Destroyed)
    }

    /// Short label for status displays
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting { .. } => "reconnecting",
            ConnectionState::Destroyed => "destroyed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(ConnectionState::Connecting.is_connecting());
        assert!(ConnectionState::Reconnecting { attempt: 2 }.is_connecting());
        assert!(!ConnectionState::Disconnected.is_connecting());
        assert!(ConnectionState::Destroyed.is_destroyed());
    }

    #[test]
    fn test_state_serializes_with_tag() {
        let json = serde_json::to_string(&ConnectionState::Reconnecting { attempt: 3 }).unwrap();
        assert_eq!(json, r#"{"state":"reconnecting","attempt":3}"#);
    }
}
