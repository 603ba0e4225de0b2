//! Realtime Service
//!
//! Composition point that owns one connection manager, one message router,
//! one change broadcaster and the injected event bus, and wires the data
//! flow between them:
//!
//! ```text
//! state source ─▶ ChangeBroadcaster ─▶ Publisher ─┬─▶ ConnectionManager ─▶ peers
//!                                                 └─▶ EventBus
//! peers ─▶ ConnectionManager ─▶ MessageRouter ─▶ EventBus ─▶ consumers
//! ```
//!
//! Remote subscriptions are kept here and replayed after every
//! (re)connection, since the server forgets them when the link drops.

use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::broadcast::{
    BroadcastError, BroadcasterConfig, ChangeBroadcaster, Publisher, StateSource,
};
use crate::connection::{ConnectionConfig, ConnectionError, ConnectionManager, Connector};
use crate::events::{CallbackId, EventBus, EventOrigin, LocalEvent};
use crate::protocol::{ConnectionState, EventType, Message};
use crate::router::{MessageRouter, RecipientContext, RouterConfig, RouterError};

/// Listener id the router is registered under on the connection
pub const ROUTER_LISTENER_ID: &str = "router";

/// Priority of the built-in routes that forward remote events to the bus
pub const BUS_FORWARD_PRIORITY: i32 = 0;

/// Control message types exchanged with the server
pub const SUBSCRIBE: &str = "subscribe";
pub const UNSUBSCRIBE: &str = "unsubscribe";

/// Errors returned by the realtime service
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Router error: {0}")]
    Router(#[from] RouterError),

    #[error("Broadcast error: {0}")]
    Broadcast(#[from] BroadcastError),

    #[error("Service destroyed")]
    Destroyed,
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Equality filters sent with a subscription, e.g. `buildingId = b1`
pub type SubscriptionFilters = BTreeMap<String, String>;

/// A remote subscription
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub subscription_id: String,
    pub event_types: Vec<EventType>,
    pub filters: SubscriptionFilters,
}

impl Subscription {
    fn subscribe_message(&self) -> Message {
        Message::new(SUBSCRIBE, json!(self))
    }

    fn unsubscribe_message(&self) -> Message {
        Message::new(UNSUBSCRIBE, json!({ "subscriptionId": self.subscription_id }))
    }
}

/// Everything needed to build a [`RealtimeService`]
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub connection: ConnectionConfig,
    pub router: RouterConfig,
    pub broadcaster: BroadcasterConfig,
    /// Start the change broadcaster in [`RealtimeService::start`]
    pub broadcaster_enabled: bool,
    /// Initial recipient context; without one, taxonomy events are withheld
    pub context: Option<RecipientContext>,
}

impl ServiceOptions {
    pub fn new(connection: ConnectionConfig) -> Self {
        Self {
            connection,
            router: RouterConfig::default(),
            broadcaster: BroadcasterConfig::default(),
            broadcaster_enabled: true,
            context: None,
        }
    }

    pub fn with_context(mut self, context: RecipientContext) -> Self {
        self.context = Some(context);
        self
    }
}

type Subscriptions = Arc<RwLock<HashMap<String, Subscription>>>;

/// Owns and wires the realtime components
pub struct RealtimeService {
    connection: ConnectionManager,
    router: MessageRouter,
    broadcaster: ChangeBroadcaster,
    bus: Arc<EventBus>,
    subscriptions: Subscriptions,
    broadcaster_enabled: bool,
    replay: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl RealtimeService {
    /// Build and wire the components. Must be called inside a tokio runtime.
    pub fn new(
        options: ServiceOptions,
        connector: Arc<dyn Connector>,
        source: Arc<dyn StateSource>,
        bus: Arc<EventBus>,
    ) -> ServiceResult<Self> {
        let connection = ConnectionManager::new(options.connection, connector);
        let router = MessageRouter::spawn(options.router);

        if let Some(context) = options.context {
            router.update_context(context)?;
        }

        for event_type in EventType::ALL {
            let bus = Arc::clone(&bus);
            router.add_route(
                event_type.as_str(),
                move |message| {
                    bus.emit(&LocalEvent::from_message(message, EventOrigin::Remote));
                    Ok(())
                },
                BUS_FORWARD_PRIORITY,
                false,
            )?;
        }

        let inbound = router.clone();
        connection.add_listener(
            ROUTER_LISTENER_ID,
            move |message| Ok(inbound.enqueue(message.clone())?),
            None,
        );

        let publisher = Publisher::new(Arc::new(connection.clone()), Arc::clone(&bus));
        let broadcaster = ChangeBroadcaster::new(options.broadcaster, source, publisher);

        let subscriptions: Subscriptions = Arc::new(RwLock::new(HashMap::new()));
        let replay = tokio::spawn(replay_subscriptions(
            connection.clone(),
            connection.status(),
            Arc::clone(&subscriptions),
        ));

        Ok(Self {
            connection,
            router,
            broadcaster,
            bus,
            subscriptions,
            broadcaster_enabled: options.broadcaster_enabled,
            replay: Mutex::new(Some(replay)),
            destroyed: AtomicBool::new(false),
        })
    }

    fn ensure_alive(&self) -> ServiceResult<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(ServiceError::Destroyed);
        }
        Ok(())
    }

    /// Start the broadcaster (when enabled) and open the connection
    ///
    /// A failed first connect is returned, but the reconnect it scheduled
    /// keeps running and the broadcaster stays up.
    pub async fn start(&self) -> ServiceResult<()> {
        self.ensure_alive()?;
        if self.broadcaster_enabled && !self.broadcaster.is_running() {
            self.broadcaster.start()?;
        }
        self.connection.connect().await?;
        Ok(())
    }

    /// Register interest in event types with the server
    ///
    /// Sent immediately when connected, and again after every reconnection.
    pub fn subscribe(
        &self,
        event_types: Vec<EventType>,
        filters: SubscriptionFilters,
    ) -> ServiceResult<String> {
        self.ensure_alive()?;
        let subscription = Subscription {
            subscription_id: format!("sub-{}", uuid::Uuid::new_v4()),
            event_types,
            filters,
        };
        let id = subscription.subscription_id.clone();

        if self.connection.state().is_connected() {
            if let Err(e) = self.connection.send(&subscription.subscribe_message()) {
                tracing::debug!(subscription_id = %id, error = %e, "Subscribe deferred until reconnect");
            }
        }

        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), subscription);
        tracing::info!(subscription_id = %id, "Subscription added");
        Ok(id)
    }

    /// Drop a subscription; returns whether it existed
    pub fn unsubscribe(&self, subscription_id: &str) -> bool {
        let removed = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(subscription_id);

        let Some(subscription) = removed else {
            return false;
        };
        if self.connection.state().is_connected() {
            if let Err(e) = self.connection.send(&subscription.unsubscribe_message()) {
                tracing::debug!(subscription_id, error = %e, "Unsubscribe not delivered");
            }
        }
        tracing::info!(subscription_id, "Subscription removed");
        true
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        let mut subs: Vec<_> = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        subs.sort_by(|a, b| a.subscription_id.cmp(&b.subscription_id));
        subs
    }

    /// Register a local consumer on the event bus
    pub fn on<F>(&self, event_type: impl Into<String>, callback: F) -> CallbackId
    where
        F: Fn(&LocalEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.bus.on(event_type, callback)
    }

    pub fn off(&self, event_type: &str, id: CallbackId) -> bool {
        self.bus.off(event_type, id)
    }

    pub fn update_context(&self, context: RecipientContext) -> ServiceResult<()> {
        Ok(self.router.update_context(context)?)
    }

    pub fn status(&self) -> watch::Receiver<ConnectionState> {
        self.connection.status()
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn broadcaster(&self) -> &ChangeBroadcaster {
        &self.broadcaster
    }

    /// Publisher for manual `broadcast_*` calls
    pub fn publisher(&self) -> &Publisher {
        self.broadcaster.publisher()
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Tear everything down. Safe to call more than once.
    ///
    /// The injected event bus keeps its registrations; they belong to the caller.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.broadcaster.destroy();
        self.connection.destroy();
        self.router.shutdown();
        if let Some(handle) = self
            .replay
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        tracing::info!("Realtime service destroyed");
    }
}

impl Drop for RealtimeService {
    fn drop(&mut self) {
        self.destroy();
    }
}

async fn replay_subscriptions(
    connection: ConnectionManager,
    mut status: watch::Receiver<ConnectionState>,
    subscriptions: Subscriptions,
) {
    while status.changed().await.is_ok() {
        if !status.borrow_and_update().is_connected() {
            continue;
        }

        let active: Vec<Subscription> = subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        if active.is_empty() {
            continue;
        }

        tracing::info!(count = active.len(), "Replaying subscriptions");
        for subscription in &active {
            if let Err(e) = connection.send(&subscription.subscribe_message()) {
                tracing::warn!(
                    subscription_id = %subscription.subscription_id,
                    error = %e,
                    "Subscription replay failed"
                );
                break;
            }
        }
    }
}
