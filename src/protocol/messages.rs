//! Wire Message Types
//!
//! Defines the envelope exchanged over the realtime connection and the
//! event taxonomy carried in its `type` field.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Message type used for heartbeats
pub const PING: &str = "ping";

/// Message type a server uses to answer heartbeats
pub const PONG: &str = "pong";

/// Wire-level unit exchanged over the connection
///
/// Serialized as `{"id"?: string, "type": string, "data": any, "timestamp": number}`.
/// A message is never mutated after it has been sent; a retried send reuses
/// the same value so its `id` is preserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique id per logical send
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Event type or control type (e.g. "worker_status", "ping")
    #[serde(rename = "type")]
    pub kind: String,
    /// Arbitrary JSON payload
    #[serde(default)]
    pub data: Value,
    /// Milliseconds since the Unix epoch
    #[serde(default = "now_millis")]
    pub timestamp: i64,
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

impl Message {
    /// Create a message with a fresh id and the current timestamp
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            id: Some(Uuid::new_v4().to_string()),
            kind: kind.into(),
            data,
            timestamp: now_millis(),
        }
    }

    /// Create a message for one of the taxonomy event types
    pub fn event(event_type: EventType, data: Value) -> Self {
        Self::new(event_type.as_str(), data)
    }

    /// Heartbeat message
    pub fn ping() -> Self {
        Self::new(PING, Value::Null)
    }

    /// The taxonomy event type, if `kind` names one
    pub fn event_type(&self) -> Option<EventType> {
        self.kind.parse().ok()
    }

    /// Look up a string field in the payload, e.g. `buildingId`
    pub fn data_str(&self, field: &str) -> Option<&str> {
        self.data.get(field).and_then(Value::as_str)
    }
}

/// Event taxonomy used as the message `type`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TaskCompleted,
    TaskUpdated,
    WorkerStatus,
    BuildingUpdate,
    InventoryChange,
    AnalyticsUpdate,
    SystemAlert,
    Emergency,
}

impl EventType {
    /// Every event type, in taxonomy order
    pub const ALL: [EventType; 8] = [
        EventType::TaskCompleted,
        EventType::TaskUpdated,
        EventType::WorkerStatus,
        EventType::BuildingUpdate,
        EventType::InventoryChange,
        EventType::AnalyticsUpdate,
        EventType::SystemAlert,
        EventType::Emergency,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TaskCompleted => "task_completed",
            EventType::TaskUpdated => "task_updated",
            EventType::WorkerStatus => "worker_status",
            EventType::BuildingUpdate => "building_update",
            EventType::InventoryChange => "inventory_change",
            EventType::AnalyticsUpdate => "analytics_update",
            EventType::SystemAlert => "system_alert",
            EventType::Emergency => "emergency",
        }
    }

    /// Visibility category used by the router's permission table
    pub fn category(&self) -> Category {
        match self {
            EventType::TaskCompleted | EventType::TaskUpdated => Category::Task,
            EventType::WorkerStatus => Category::Worker,
            EventType::BuildingUpdate => Category::Building,
            EventType::InventoryChange => Category::Inventory,
            EventType::AnalyticsUpdate => Category::Analytics,
            EventType::SystemAlert => Category::System,
            EventType::Emergency => Category::Emergency,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownEventType(s.to_string()))
    }
}

/// Returned when a string does not name a taxonomy event type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event type: {0}")]
pub struct UnknownEventType(pub String);

/// Visibility category of an event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Task,
    Worker,
    Building,
    Inventory,
    Analytics,
    System,
    Emergency,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_deserialize_without_id() {
        let json = r#"{"type": "worker_status", "data": {"workerId": "w1"}, "timestamp": 1699000000000}"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert!(msg.id.is_none());
        assert_eq!(msg.kind, "worker_status");
        assert_eq!(msg.data_str("workerId"), Some("w1"));
        assert_eq!(msg.timestamp, 1699000000000);
        assert_eq!(msg.event_type(), Some(EventType::WorkerStatus));
    }

    #[test]
    fn test_message_serialize_uses_type_field() {
        let msg = Message::event(EventType::Emergency, json!({"reason": "fire"}));
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"emergency\""));
        assert!(json.contains("\"id\":"));
        assert!(json.contains("\"reason\":\"fire\""));
    }

    #[test]
    fn test_message_missing_type_is_rejected() {
        let json = r#"{"data": {}, "timestamp": 1}"#;
        assert!(serde_json::from_str::<Message>(json).is_err());
    }

    #[test]
    fn test_new_messages_get_distinct_ids() {
        let a = Message::ping();
        let b = Message::ping();
        assert_eq!(a.kind, PING);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_event_type_parse() {
        assert_eq!("building_update".parse::<EventType>(), Ok(EventType::BuildingUpdate));
        assert!("ping".parse::<EventType>().is_err());
        for t in EventType::ALL {
            assert_eq!(t.as_str().parse::<EventType>(), Ok(t));
        }
    }

    #[test]
    fn test_event_type_categories() {
        assert_eq!(EventType::TaskCompleted.category(), Category::Task);
        assert_eq!(EventType::TaskUpdated.category(), Category::Task);
        assert_eq!(EventType::BuildingUpdate.category(), Category::Building);
        assert_eq!(EventType::Emergency.category(), Category::Emergency);
    }
}
