//! Broadcast publishing
//!
//! A publish sends one message to the remote peers and emits the matching
//! local event. The connection being down does not stop the local emit;
//! nothing is queued for later delivery.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use super::error::BroadcastResult;
use crate::connection::{ConnectionError, ConnectionManager, ConnectionResult};
use crate::events::{EventBus, EventOrigin, LocalEvent};
use crate::protocol::{EventType, Message};

/// Remote side of a broadcast
pub trait RemoteSink: Send + Sync {
    fn send(&self, message: &Message) -> ConnectionResult<()>;
}

impl RemoteSink for ConnectionManager {
    fn send(&self, message: &Message) -> ConnectionResult<()> {
        ConnectionManager::send(self, message)
    }
}

/// Sends broadcasts remotely and mirrors them on the local bus
#[derive(Clone)]
pub struct Publisher {
    remote: Arc<dyn RemoteSink>,
    bus: Arc<EventBus>,
}

impl Publisher {
    pub fn new(remote: Arc<dyn RemoteSink>, bus: Arc<EventBus>) -> Self {
        Self { remote, bus }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Publish `data` under `event_type`; returns the message that went out
    pub fn publish(&self, event_type: EventType, data: Value) -> Message {
        let message = Message::event(event_type, data);

        match self.remote.send(&message) {
            Ok(()) => tracing::trace!(kind = %event_type, id = ?message.id, "Broadcast sent"),
            Err(ConnectionError::NotConnected) => {
                tracing::debug!(kind = %event_type, "Connection down, broadcast delivered locally only")
            }
            Err(e) => tracing::warn!(kind = %event_type, error = %e, "Remote broadcast failed"),
        }

        self.bus
            .emit(&LocalEvent::from_message(&message, EventOrigin::Local));
        message
    }

    fn publish_serialized<T: Serialize>(&self, event_type: EventType, data: &T) -> BroadcastResult<Message> {
        Ok(self.publish(event_type, serde_json::to_value(data)?))
    }

    pub fn broadcast_task_completed<T: Serialize>(&self, data: &T) -> BroadcastResult<Message> {
        self.publish_serialized(EventType::TaskCompleted, data)
    }

    pub fn broadcast_task_updated<T: Serialize>(&self, data: &T) -> BroadcastResult<Message> {
        self.publish_serialized(EventType::TaskUpdated, data)
    }

    pub fn broadcast_worker_status<T: Serialize>(&self, data: &T) -> BroadcastResult<Message> {
        self.publish_serialized(EventType::WorkerStatus, data)
    }

    pub fn broadcast_building_update<T: Serialize>(&self, data: &T) -> BroadcastResult<Message> {
        self.publish_serialized(EventType::BuildingUpdate, data)
    }

    pub fn broadcast_inventory_change<T: Serialize>(&self, data: &T) -> BroadcastResult<Message> {
        self.publish_serialized(EventType::InventoryChange, data)
    }

    pub fn broadcast_analytics_update<T: Serialize>(&self, data: &T) -> BroadcastResult<Message> {
        self.publish_serialized(EventType::AnalyticsUpdate, data)
    }

    pub fn broadcast_system_alert<T: Serialize>(&self, data: &T) -> BroadcastResult<Message> {
        self.publish_serialized(EventType::SystemAlert, data)
    }

    pub fn broadcast_emergency<T: Serialize>(&self, data: &T) -> BroadcastResult<Message> {
        self.publish_serialized(EventType::Emergency, data)
    }
}

/// Collects sent messages instead of writing to a socket
#[cfg(test)]
pub(crate) mod recording {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct RecordingSink {
        sent: Mutex<Vec<Message>>,
        offline: std::sync::atomic::AtomicBool,
    }

    impl RecordingSink {
        pub(crate) fn sent(&self) -> Vec<Message> {
            self.sent.lock().unwrap().clone()
        }

        pub(crate) fn count(&self, event_type: EventType) -> usize {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|m| m.kind == event_type.as_str())
                .count()
        }

        pub(crate) fn set_offline(&self, offline: bool) {
            self.offline
                .store(offline, std::sync::atomic::Ordering::SeqCst);
        }
    }

    impl RemoteSink for RecordingSink {
        fn send(&self, message: &Message) -> ConnectionResult<()> {
            if self.offline.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(ConnectionError::NotConnected);
            }
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }
    }
}
