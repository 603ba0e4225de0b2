//! Local Event Bus
//!
//! Synchronous in-process pub/sub. Callbacks run on the emitting task, in
//! registration order, and a failing callback never stops delivery to the
//! callbacks registered after it.
//!
//! Callers own their registrations: every `on` must be paired with an `off`
//! when the consumer goes away. Nothing is collected implicitly.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use super::isolate;
use crate::protocol::Message;

/// Event type that receives every emitted event
pub const ANY_EVENT: &str = "*";

/// Handle returned by [`EventBus::on`], used to unregister the callback
pub type CallbackId = u64;

/// Callback invoked for each matching event
pub type EventCallback = Arc<dyn Fn(&LocalEvent) -> anyhow::Result<()> + Send + Sync>;

/// Where an event came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOrigin {
    /// Produced in this process (e.g. by the change broadcaster)
    Local,
    /// Received from a remote peer through the router
    Remote,
}

/// An event delivered to local consumers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalEvent {
    /// Event type, e.g. "worker_status"
    pub event_type: String,
    pub data: Value,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub origin: EventOrigin,
    /// Id of the wire message this event mirrors, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl LocalEvent {
    /// Event with no wire counterpart
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            timestamp: chrono::Utc::now().timestamp_millis(),
            origin: EventOrigin::Local,
            message_id: None,
        }
    }

    /// Mirror a wire message
    pub fn from_message(message: &Message, origin: EventOrigin) -> Self {
        Self {
            event_type: message.kind.clone(),
            data: message.data.clone(),
            timestamp: message.timestamp,
            origin,
            message_id: message.id.clone(),
        }
    }
}

struct Registration {
    id: CallbackId,
    callback: EventCallback,
}

/// Typed in-process publish/subscribe
pub struct EventBus {
    /// Event type → callbacks in registration order
    callbacks: RwLock<HashMap<String, Vec<Registration>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            callbacks: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a callback for an event type ([`ANY_EVENT`] for all)
    pub fn on<F>(&self, event_type: impl Into<String>, callback: F) -> CallbackId
    where
        F: Fn(&LocalEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let event_type = event_type.into();

        tracing::trace!(event_type = %event_type, callback_id = id, "Registered bus callback");

        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event_type)
            .or_default()
            .push(Registration {
                id,
                callback: Arc::new(callback),
            });
        id
    }

    /// Unregister a callback. Returns false if it was not registered.
    pub fn off(&self, event_type: &str, id: CallbackId) -> bool {
        let mut callbacks = self
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let Some(registrations) = callbacks.get_mut(event_type) else {
            return false;
        };
        let before = registrations.len();
        registrations.retain(|r| r.id != id);
        let removed = registrations.len() != before;

        if registrations.is_empty() {
            callbacks.remove(event_type);
        }
        removed
    }

    /// Deliver an event to every matching callback
    ///
    /// Returns the number of callbacks that completed without error.
    pub fn emit(&self, event: &LocalEvent) -> usize {
        // Snapshot first so callbacks may call `on`/`off` without deadlocking.
        let targets: Vec<(CallbackId, EventCallback)> = {
            let callbacks = self.callbacks.read().unwrap_or_else(PoisonError::into_inner);
            let own = (event.event_type != ANY_EVENT).then_some(event.event_type.as_str());
            own.into_iter()
                .chain([ANY_EVENT])
                .filter_map(|key| callbacks.get(key))
                .flatten()
                .map(|r| (r.id, Arc::clone(&r.callback)))
                .collect()
        };

        let mut delivered = 0;
        for (id, callback) in targets {
            match isolate(|| callback(event)) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(
                        event_type = %event.event_type,
                        callback_id = id,
                        error = %e,
                        "Event bus callback failed"
                    );
                }
            }
        }
        delivered
    }

    /// Number of callbacks registered for an event type
    pub fn listener_count(&self, event_type: &str) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_type)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Drop every registration
    pub fn clear(&self) {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&'static str) -> EventCallback) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_for = Arc::clone(&log);
        let make = move |name: &'static str| -> EventCallback {
            let log = Arc::clone(&log_for);
            Arc::new(move |_event: &LocalEvent| {
                log.lock().unwrap().push(name.to_string());
                Ok(())
            })
        };
        (log, make)
    }

    #[test]
    fn test_delivery_in_registration_order() {
        let bus = EventBus::new();
        let (log, make) = recorder();

        for name in ["first", "second", "third"] {
            let cb = make(name);
            bus.on("worker_status", move |e| cb(e));
        }

        let delivered = bus.emit(&LocalEvent::new("worker_status", json!({})));
        assert_eq!(delivered, 3);
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_only_matching_type_receives() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let cb = make("tasks");
        bus.on("task_completed", move |e| cb(e));

        assert_eq!(bus.emit(&LocalEvent::new("worker_status", json!({}))), 0);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_failing_callback_does_not_block_others() {
        let bus = EventBus::new();
        let (log, make) = recorder();

        bus.on("emergency", |_| anyhow::bail!("dashboard offline"));
        bus.on("emergency", |_| panic!("bad consumer"));
        let cb = make("pager");
        bus.on("emergency", move |e| cb(e));

        let delivered = bus.emit(&LocalEvent::new("emergency", json!({"level": 5})));
        assert_eq!(delivered, 1);
        assert_eq!(*log.lock().unwrap(), vec!["pager"]);
    }

    #[test]
    fn test_wildcard_event_delivered_once() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let cb = make("audit");
        bus.on(ANY_EVENT, move |e| cb(e));

        assert_eq!(bus.emit(&LocalEvent::new(ANY_EVENT, json!({}))), 1);
        assert_eq!(*log.lock().unwrap(), vec!["audit"]);
    }

    #[test]
    fn test_off_removes_callback() {
        let bus = EventBus::new();
        let id = bus.on("building_update", |_| Ok(()));
        assert_eq!(bus.listener_count("building_update"), 1);

        assert!(bus.off("building_update", id));
        assert!(!bus.off("building_update", id));
        assert_eq!(bus.listener_count("building_update"), 0);
        assert_eq!(bus.emit(&LocalEvent::new("building_update", json!({}))), 0);
    }

    #[test]
    fn test_any_event_receives_everything() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let cb = make("audit");
        bus.on(ANY_EVENT, move |e| cb(e));

        bus.emit(&LocalEvent::new("task_updated", json!({})));
        bus.emit(&LocalEvent::new("system_alert", json!({})));
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_callback_may_unregister_itself() {
        let bus = Arc::new(EventBus::new());
        let bus_for_cb = Arc::clone(&bus);
        let id_slot = Arc::new(Mutex::new(None::<CallbackId>));
        let slot = Arc::clone(&id_slot);

        let id = bus.on("task_completed", move |_| {
            if let Some(id) = *slot.lock().unwrap() {
                bus_for_cb.off("task_completed", id);
            }
            Ok(())
        });
        *id_slot.lock().unwrap() = Some(id);

        assert_eq!(bus.emit(&LocalEvent::new("task_completed", json!({}))), 1);
        assert_eq!(bus.emit(&LocalEvent::new("task_completed", json!({}))), 0);
    }

    #[test]
    fn test_from_message_keeps_id() {
        let msg = Message::new("worker_status", json!({"workerId": "w1"}));
        let event = LocalEvent::from_message(&msg, EventOrigin::Remote);
        assert_eq!(event.event_type, "worker_status");
        assert_eq!(event.message_id, msg.id);
        assert_eq!(event.origin, EventOrigin::Remote);
    }
}
