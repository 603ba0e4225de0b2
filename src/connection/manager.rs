//! Connection Manager
//!
//! Owns the single long-lived connection to the realtime endpoint and its
//! connect → heartbeat → reconnect lifecycle.
//!
//! ## Lifecycle
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──ok──▶ Connected
//!      ▲                          │                  │ abnormal close / error
//!      │ attempts exhausted       │ error/timeout    ▼
//!      └──────────────────── Reconnecting { attempt } ──backoff──▶ Connecting
//!
//! any state ──destroy()──▶ Destroyed
//! ```
//!
//! Reconnects wait `reconnect_interval × 2^(attempt − 1)`. Once `attempt`
//! exceeds `max_reconnect_attempts` nothing is scheduled until a caller
//! invokes [`ConnectionManager::connect`] again, which restarts the count.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::config::{ConnectionConfig, HEARTBEAT_TIMEOUT_CLOSURE, NORMAL_CLOSURE};
use super::error::{ConnectionError, ConnectionResult};
use super::transport::{Connector, InboundFrame, OutboundFrame, TransportLink};
use crate::events::isolate;
use crate::protocol::{ConnectionState, Message};

/// Callback receiving inbound messages
pub type ListenerCallback = Arc<dyn Fn(&Message) -> anyhow::Result<()> + Send + Sync>;

type ConnectFuture = Shared<BoxFuture<'static, ConnectionResult<()>>>;

struct ListenerEntry {
    callback: ListenerCallback,
    /// Accepted message types; `None` accepts everything
    filters: Option<HashSet<String>>,
}

impl ListenerEntry {
    fn accepts(&self, kind: &str) -> bool {
        self.filters
            .as_ref()
            .map(|filters| filters.contains(kind))
            .unwrap_or(true)
    }
}

struct ActiveLink {
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    generation: u64,
}

#[derive(Default)]
struct Timers {
    heartbeat: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl Timers {
    fn abort_all(&mut self) {
        for handle in [
            self.heartbeat.take(),
            self.reconnect.take(),
            self.reader.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Manages one realtime connection
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    state: watch::Sender<ConnectionState>,
    destroyed: AtomicBool,
    attempts: AtomicU32,
    /// Incremented per opened link so stale transport events are ignored
    generation: AtomicU64,
    link: Mutex<Option<ActiveLink>>,
    in_flight: Mutex<Option<ConnectFuture>>,
    timers: Mutex<Timers>,
    listeners: RwLock<HashMap<String, ListenerEntry>>,
    last_error: Mutex<Option<ConnectionError>>,
    last_inbound: Mutex<Instant>,
}

impl ConnectionManager {
    /// Create a manager. Nothing is opened until [`connect`](Self::connect).
    pub fn new(config: ConnectionConfig, connector: Arc<dyn Connector>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                state,
                destroyed: AtomicBool::new(false),
                attempts: AtomicU32::new(0),
                generation: AtomicU64::new(0),
                link: Mutex::new(None),
                in_flight: Mutex::new(None),
                timers: Mutex::new(Timers::default()),
                listeners: RwLock::new(HashMap::new()),
                last_error: Mutex::new(None),
                last_inbound: Mutex::new(Instant::now()),
            }),
        }
    }

    /// Open the connection
    ///
    /// Concurrent calls while a connect is in flight share its outcome; only
    /// one transport is ever opened. Returns immediately when already
    /// connected. On failure a reconnect is scheduled and the error is
    /// returned to this caller only. Calling this after reconnects were
    /// exhausted starts a fresh round of attempts.
    ///
    /// The attempt runs on its own task, so it completes even if every
    /// caller stops waiting.
    pub async fn connect(&self) -> ConnectionResult<()> {
        if self.inner.is_destroyed() {
            return Err(ConnectionError::Destroyed);
        }
        if self.state().is_connected() {
            return Ok(());
        }

        let attempt = {
            let mut in_flight = lock(&self.inner.in_flight);
            match in_flight.as_ref() {
                Some(pending) => pending.clone(),
                None => {
                    self.inner.reset_exhausted_attempts();
                    let task = tokio::spawn(Arc::clone(&self.inner).open());
                    let pending = async move {
                        task.await.unwrap_or_else(|e| {
                            Err(ConnectionError::Transport(format!("connect task failed: {}", e)))
                        })
                    }
                    .boxed()
                    .shared();
                    *in_flight = Some(pending.clone());
                    pending
                }
            }
        };

        attempt.await
    }

    /// Serialize and transmit a message immediately
    ///
    /// Nothing is queued while disconnected: the call fails with
    /// [`ConnectionError::NotConnected`] and the message is dropped.
    pub fn send(&self, message: &Message) -> ConnectionResult<()> {
        self.inner.send(message)
    }

    /// Register a receiver of inbound messages
    ///
    /// `filters` restricts delivery to the listed message types. Registering
    /// an existing id replaces the previous listener.
    pub fn add_listener<F>(&self, id: impl Into<String>, callback: F, filters: Option<Vec<String>>)
    where
        F: Fn(&Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = id.into();
        tracing::debug!(listener_id = %id, filters = ?filters, "Listener registered");

        let entry = ListenerEntry {
            callback: Arc::new(callback),
            filters: filters.map(|f| f.into_iter().collect()),
        };
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, entry);
    }

    /// Unregister a listener. Returns false if the id was unknown.
    pub fn remove_listener(&self, id: &str) -> bool {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some()
    }

    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    /// Observable state for dashboards
    pub fn status(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Consecutive failed attempts since the last successful connect
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Most recent transport error, including reconnect exhaustion
    pub fn last_error(&self) -> Option<ConnectionError> {
        lock(&self.inner.last_error).clone()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Tear everything down
    ///
    /// Stops the heartbeat, cancels any scheduled reconnect, closes the link
    /// with a normal-closure code and clears all listeners. Safe to call
    /// more than once.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        lock(&self.inner.timers).abort_all();
        lock(&self.inner.in_flight).take();

        if let Some(link) = lock(&self.inner.link).take() {
            let _ = link.outbound.send(OutboundFrame::Close {
                code: NORMAL_CLOSURE,
                reason: "client shutdown".to_string(),
            });
        }

        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        self.inner.set_state(ConnectionState::Destroyed);
        tracing::info!(url = %self.inner.config.url, "Connection manager destroyed");
    }
}

impl Inner {
    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn reset_exhausted_attempts(&self) {
        let max = self.config.max_reconnect_attempts;
        if *self.state.borrow() == ConnectionState::Disconnected
            && self.attempts.load(Ordering::SeqCst) > max
        {
            tracing::info!(max_attempts = max, "Manual connect after exhaustion, resetting attempts");
            self.attempts.store(0, Ordering::SeqCst);
        }
    }

    fn record_error(&self, error: ConnectionError) {
        *lock(&self.last_error) = Some(error);
    }

    fn current_generation(&self) -> Option<u64> {
        lock(&self.link).as_ref().map(|l| l.generation)
    }

    fn send(&self, message: &Message) -> ConnectionResult<()> {
        if !self.state.borrow().is_connected() {
            return Err(ConnectionError::NotConnected);
        }

        let text = serde_json::to_string(message)?;
        let link = lock(&self.link);
        let link = link.as_ref().ok_or(ConnectionError::NotConnected)?;

        link.outbound
            .send(OutboundFrame::Text(text))
            .map_err(|_| ConnectionError::NotConnected)?;

        tracing::trace!(kind = %message.kind, id = ?message.id, "Message sent");
        Ok(())
    }

    /// One connect attempt; runs inside the shared in-flight future
    async fn open(self: Arc<Self>) -> ConnectionResult<()> {
        if self.is_destroyed() {
            return Err(ConnectionError::Destroyed);
        }
        self.set_state(ConnectionState::Connecting);
        tracing::info!(url = %self.config.url, "Connecting");

        let outcome = match tokio::time::timeout(
            self.config.connect_timeout,
            self.connector.connect(&self.config),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout(self.config.connect_timeout)),
        };

        let result = match outcome {
            Ok(link) if self.is_destroyed() => {
                let _ = link.outbound.send(OutboundFrame::Close {
                    code: NORMAL_CLOSURE,
                    reason: "client shutdown".to_string(),
                });
                Err(ConnectionError::Destroyed)
            }
            Ok(link) => {
                self.attach(link);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(url = %self.config.url, error = %e, "Connect failed");
                self.record_error(e.clone());
                self.schedule_reconnect();
                Err(e)
            }
        };

        lock(&self.in_flight).take();
        result
    }

    fn attach(self: &Arc<Self>, link: TransportLink) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let TransportLink { outbound, inbound } = link;

        *lock(&self.link) = Some(ActiveLink {
            outbound,
            generation,
        });
        *lock(&self.last_inbound) = Instant::now();
        self.attempts.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected);

        tracing::info!(url = %self.config.url, generation, "Connected");

        let reader = tokio::spawn(Arc::clone(self).read_loop(inbound, generation));
        let heartbeat = tokio::spawn(Arc::clone(self).heartbeat_loop(generation));

        let mut timers = lock(&self.timers);
        for stale in [
            timers.reader.replace(reader),
            timers.heartbeat.replace(heartbeat),
            timers.reconnect.take(),
        ]
        .into_iter()
        .flatten()
        {
            stale.abort();
        }
    }

    async fn read_loop(
        self: Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<InboundFrame>,
        generation: u64,
    ) {
        while let Some(frame) = inbound.recv().await {
            match frame {
                InboundFrame::Text(text) => {
                    *lock(&self.last_inbound) = Instant::now();
                    self.dispatch_raw(&text);
                }
                InboundFrame::Pong => {
                    *lock(&self.last_inbound) = Instant::now();
                }
                InboundFrame::Closed { code, reason } => {
                    self.handle_close(generation, code, reason);
                    return;
                }
                InboundFrame::Error(e) => {
                    tracing::warn!(error = %e, "Transport error");
                    self.handle_close(generation, None, e);
                    return;
                }
            }
        }
        self.handle_close(generation, None, "transport dropped".to_string());
    }

    async fn heartbeat_loop(self: Arc<Self>, generation: u64) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;

            if self.current_generation() != Some(generation) {
                return;
            }

            if let Some(timeout) = self.config.heartbeat_timeout {
                let silent_for = lock(&self.last_inbound).elapsed();
                if silent_for > timeout {
                    tracing::warn!(
                        silent_ms = silent_for.as_millis() as u64,
                        "No traffic within heartbeat timeout, closing connection"
                    );
                    if let Some(link) = lock(&self.link).as_ref() {
                        let _ = link.outbound.send(OutboundFrame::Close {
                            code: HEARTBEAT_TIMEOUT_CLOSURE,
                            reason: "heartbeat timeout".to_string(),
                        });
                    }
                    self.handle_close(
                        generation,
                        Some(HEARTBEAT_TIMEOUT_CLOSURE),
                        "heartbeat timeout".to_string(),
                    );
                    return;
                }
            }

            if let Err(e) = self.send(&Message::ping()) {
                tracing::debug!(error = %e, "Heartbeat not sent");
            }
        }
    }

    fn handle_close(self: &Arc<Self>, generation: u64, code: Option<u16>, reason: String) {
        {
            let mut link = lock(&self.link);
            match link.as_ref() {
                Some(active) if active.generation == generation => {
                    *link = None;
                }
                // A newer link replaced this one, or destroy() already ran
                _ => return,
            }
        }

        if let Some(heartbeat) = lock(&self.timers).heartbeat.take() {
            heartbeat.abort();
        }

        if self.is_destroyed() {
            return;
        }

        if code == Some(NORMAL_CLOSURE) {
            tracing::info!(url = %self.config.url, "Connection closed normally");
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        tracing::warn!(url = %self.config.url, code = ?code, reason = %reason, "Connection lost");
        self.record_error(ConnectionError::Closed { code, reason });
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.is_destroyed() {
            return;
        }

        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let max = self.config.max_reconnect_attempts;

        if attempt > max {
            let error = ConnectionError::ReconnectExhausted(max);
            tracing::error!(
                url = %self.config.url,
                max_attempts = max,
                "Reconnect attempts exhausted; waiting for a manual connect"
            );
            self.record_error(error);
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        let delay = self.config.backoff_delay(attempt);
        self.set_state(ConnectionState::Reconnecting { attempt });
        tracing::info!(
            attempt,
            max_attempts = max,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );

        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Release our own slot so a failed attempt can schedule the next one
            lock(&inner.timers).reconnect.take();

            let manager = ConnectionManager { inner };
            if let Err(e) = manager.connect().await {
                tracing::debug!(attempt, error = %e, "Scheduled reconnect failed");
            }
        });

        if let Some(previous) = lock(&self.timers).reconnect.replace(handle) {
            previous.abort();
        }
    }

    fn dispatch_raw(&self, text: &str) {
        match serde_json::from_str::<Message>(text) {
            Ok(message) => self.dispatch(&message),
            Err(e) => {
                tracing::debug!(error = %e, text = %text, "Dropping unparseable message");
            }
        }
    }

    /// Deliver to every listener whose filter accepts the message type
    fn dispatch(&self, message: &Message) {
        let targets: Vec<(String, ListenerCallback)> = {
            let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
            listeners
                .iter()
                .filter(|(_, entry)| entry.accepts(&message.kind))
                .map(|(id, entry)| (id.clone(), Arc::clone(&entry.callback)))
                .collect()
        };

        tracing::trace!(kind = %message.kind, listeners = targets.len(), "Dispatching message");

        for (id, callback) in targets {
            if let Err(e) = isolate(|| callback(message)) {
                tracing::warn!(listener_id = %id, kind = %message.kind, error = %e, "Listener failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::transport::mock::{MockConnector, MockOutcome};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn test_config() -> ConnectionConfig {
        ConnectionConfig {
            url: "ws://test.local/ws".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            reconnect_interval: Duration::from_secs(1),
            max_reconnect_attempts: 3,
            connect_timeout: Duration::from_secs(10),
            ..Default::default()
        }
    }

    fn manager_with(connector: &Arc<MockConnector>, config: ConnectionConfig) -> ConnectionManager {
        let connector: Arc<dyn Connector> = Arc::clone(connector) as Arc<dyn Connector>;
        ConnectionManager::new(config, connector)
    }

    /// Let spawned tasks run without advancing the paused clock
    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_success() {
        let connector = Arc::new(MockConnector::accepting());
        let manager = manager_with(&connector, test_config());

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        manager.connect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.reconnect_attempts(), 0);

        // Already connected: no second transport
        manager.connect().await.unwrap();
        assert_eq!(connector.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_connects_share_one_transport() {
        let connector = Arc::new(MockConnector::scripted(
            vec![MockOutcome::AcceptAfter(Duration::from_millis(200))],
            MockOutcome::Accept,
        ));
        let manager = manager_with(&connector, test_config());

        let (a, b) = tokio::join!(manager.connect(), manager.connect());
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(connector.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_connects_share_failure() {
        let connector = Arc::new(MockConnector::scripted(
            vec![MockOutcome::FailAfter(
                Duration::from_millis(200),
                "refused".to_string(),
            )],
            MockOutcome::Accept,
        ));
        let manager = manager_with(&connector, test_config());

        let (a, b) = tokio::join!(manager.connect(), manager.connect());
        let expected = ConnectionError::Transport("refused".to_string());
        assert_eq!(a, Err(expected.clone()));
        assert_eq!(b, Err(expected));
        assert_eq!(connector.calls(), 1);
        assert_eq!(manager.state(), ConnectionState::Reconnecting { attempt: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connect_schedules_backoff_reconnect() {
        let connector = Arc::new(MockConnector::scripted(
            vec![MockOutcome::Fail("refused".to_string())],
            MockOutcome::Accept,
        ));
        let manager = manager_with(&connector, test_config());

        assert!(manager.connect().await.is_err());
        assert_eq!(manager.reconnect_attempts(), 1);

        // Attempt 1 waits exactly the base interval
        tokio::time::sleep(Duration::from_millis(999)).await;
        settle().await;
        assert_eq!(connector.calls(), 1);

        tokio::time::sleep(Duration::from_millis(2)).await;
        settle().await;
        assert_eq!(connector.calls(), 2);
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.reconnect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_gives_up_after_max_attempts() {
        // First connect succeeds, every later one fails
        let connector = Arc::new(MockConnector::scripted(
            vec![MockOutcome::Accept],
            MockOutcome::Fail("unreachable".to_string()),
        ));
        let manager = manager_with(&connector, test_config());
        manager.connect().await.unwrap();

        let peer = connector.take_peer().unwrap();
        peer.close(Some(1006));
        settle().await;
        assert_eq!(manager.state(), ConnectionState::Reconnecting { attempt: 1 });

        // Delays: 1s, 2s, 4s
        tokio::time::sleep(Duration::from_millis(1001)).await;
        settle().await;
        assert_eq!(connector.calls(), 2);
        assert_eq!(manager.state(), ConnectionState::Reconnecting { attempt: 2 });

        tokio::time::sleep(Duration::from_millis(2001)).await;
        settle().await;
        assert_eq!(connector.calls(), 3);
        assert_eq!(manager.state(), ConnectionState::Reconnecting { attempt: 3 });

        tokio::time::sleep(Duration::from_millis(4001)).await;
        settle().await;
        assert_eq!(connector.calls(), 4);

        // Fourth failure exceeds the maximum: nothing more is scheduled
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.last_error(), Some(ConnectionError::ReconnectExhausted(3)));

        tokio::time::sleep(Duration::from_secs(600)).await;
        settle().await;
        assert_eq!(connector.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_connect_after_exhaustion() {
        let connector = Arc::new(MockConnector::scripted(
            vec![
                MockOutcome::Fail("down".to_string()),
                MockOutcome::Fail("down".to_string()),
            ],
            MockOutcome::Accept,
        ));
        let config = ConnectionConfig {
            max_reconnect_attempts: 1,
            ..test_config()
        };
        let manager = manager_with(&connector, config);

        assert!(manager.connect().await.is_err());
        tokio::time::sleep(Duration::from_millis(1001)).await;
        settle().await;
        assert_eq!(connector.calls(), 2);
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        manager.connect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.reconnect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_manual_connect_after_exhaustion_resumes_retries() {
        let connector = Arc::new(MockConnector::scripted(
            vec![
                MockOutcome::Fail("down".to_string()),
                MockOutcome::Fail("down".to_string()),
                MockOutcome::Fail("still down".to_string()),
            ],
            MockOutcome::Accept,
        ));
        let config = ConnectionConfig {
            max_reconnect_attempts: 1,
            ..test_config()
        };
        let manager = manager_with(&connector, config);

        assert!(manager.connect().await.is_err());
        tokio::time::sleep(Duration::from_millis(1001)).await;
        settle().await;
        assert_eq!(connector.calls(), 2);
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        // The manual attempt fails too, but a new round of retries begins
        let result = manager.connect().await;
        assert_eq!(result, Err(ConnectionError::Transport("still down".to_string())));
        assert_eq!(manager.state(), ConnectionState::Reconnecting { attempt: 1 });
        assert_eq!(manager.reconnect_attempts(), 1);

        tokio::time::sleep(Duration::from_millis(1001)).await;
        settle().await;
        assert_eq!(connector.calls(), 4);
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.reconnect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_connect_still_completes() {
        let connector = Arc::new(MockConnector::scripted(
            vec![MockOutcome::AcceptAfter(Duration::from_millis(200))],
            MockOutcome::Accept,
        ));
        let manager = manager_with(&connector, test_config());

        let gave_up = tokio::time::timeout(Duration::from_millis(50), manager.connect()).await;
        assert!(gave_up.is_err());
        assert_eq!(manager.state(), ConnectionState::Connecting);

        tokio::time::sleep(Duration::from_millis(200)).await;
        settle().await;
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(connector.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_normal_close_does_not_reconnect() {
        let connector = Arc::new(MockConnector::accepting());
        let manager = manager_with(&connector, test_config());
        manager.connect().await.unwrap();

        connector.take_peer().unwrap().close(Some(NORMAL_CLOSURE));
        settle().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(connector.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_feeds_reconnect() {
        let connector = Arc::new(MockConnector::scripted(
            vec![MockOutcome::Hang],
            MockOutcome::Accept,
        ));
        let manager = manager_with(&connector, test_config());

        let result = manager.connect().await;
        assert_eq!(result, Err(ConnectionError::Timeout(Duration::from_secs(10))));
        assert_eq!(manager.state(), ConnectionState::Reconnecting { attempt: 1 });

        tokio::time::sleep(Duration::from_millis(1001)).await;
        settle().await;
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_requires_connection() {
        let connector = Arc::new(MockConnector::accepting());
        let manager = manager_with(&connector, test_config());

        let msg = Message::new("task_updated", json!({"taskId": "t1"}));
        assert_eq!(manager.send(&msg), Err(ConnectionError::NotConnected));

        manager.connect().await.unwrap();
        manager.send(&msg).unwrap();

        let mut peer = connector.take_peer().unwrap();
        let written = peer.written();
        assert_eq!(written.len(), 1);
        match &written[0] {
            OutboundFrame::Text(text) => {
                let sent: Message = serde_json::from_str(text).unwrap();
                assert_eq!(sent, msg);
            }
            other => panic!("Expected text frame, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_sends_ping() {
        let connector = Arc::new(MockConnector::accepting());
        let manager = manager_with(&connector, test_config());
        manager.connect().await.unwrap();
        let mut peer = connector.take_peer().unwrap();

        tokio::time::sleep(Duration::from_secs(61)).await;
        settle().await;

        let pings = peer
            .written()
            .into_iter()
            .filter(|f| matches!(f, OutboundFrame::Text(t) if t.contains("\"type\":\"ping\"")))
            .count();
        assert_eq!(pings, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_timeout_forces_reconnect() {
        let connector = Arc::new(MockConnector::accepting());
        let config = ConnectionConfig {
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Some(Duration::from_secs(15)),
            ..test_config()
        };
        let manager = manager_with(&connector, config);
        manager.connect().await.unwrap();
        let _silent_peer = connector.take_peer().unwrap();

        tokio::time::sleep(Duration::from_secs(21)).await;
        settle().await;
        assert_eq!(manager.state(), ConnectionState::Reconnecting { attempt: 1 });

        tokio::time::sleep(Duration::from_millis(1001)).await;
        settle().await;
        assert_eq!(connector.calls(), 2);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_filters_and_isolation() {
        let connector = Arc::new(MockConnector::accepting());
        let manager = manager_with(&connector, test_config());

        let all = Arc::new(AtomicUsize::new(0));
        let tasks_only = Arc::new(AtomicUsize::new(0));

        manager.add_listener("broken", |_| anyhow::bail!("consumer error"), None);
        let counter = Arc::clone(&all);
        manager.add_listener(
            "all",
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            None,
        );
        let counter = Arc::clone(&tasks_only);
        manager.add_listener(
            "tasks",
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            Some(vec!["task_completed".to_string()]),
        );

        manager.connect().await.unwrap();
        let peer = connector.take_peer().unwrap();
        peer.send_text(r#"{"type":"task_completed","data":{"taskId":"t1"},"timestamp":1}"#);
        peer.send_text(r#"{"type":"worker_status","data":{},"timestamp":2}"#);
        peer.send_text("not json at all");
        settle().await;

        assert_eq!(all.load(Ordering::SeqCst), 2);
        assert_eq!(tasks_only.load(Ordering::SeqCst), 1);

        assert!(manager.remove_listener("tasks"));
        assert!(!manager.remove_listener("tasks"));
        assert_eq!(manager.listener_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_is_idempotent_and_cancels_reconnect() {
        let connector = Arc::new(MockConnector::scripted(
            vec![MockOutcome::Fail("refused".to_string())],
            MockOutcome::Accept,
        ));
        let manager = manager_with(&connector, test_config());
        manager.add_listener("l", |_| Ok(()), None);

        assert!(manager.connect().await.is_err());
        assert!(matches!(manager.state(), ConnectionState::Reconnecting { .. }));

        manager.destroy();
        manager.destroy();
        assert_eq!(manager.state(), ConnectionState::Destroyed);
        assert_eq!(manager.listener_count(), 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(connector.calls(), 1);

        assert_eq!(manager.connect().await, Err(ConnectionError::Destroyed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_closes_with_normal_code() {
        let connector = Arc::new(MockConnector::accepting());
        let manager = manager_with(&connector, test_config());
        manager.connect().await.unwrap();
        let mut peer = connector.take_peer().unwrap();

        manager.destroy();
        let written = peer.written();
        assert_eq!(
            written.last(),
            Some(&OutboundFrame::Close {
                code: NORMAL_CLOSURE,
                reason: "client shutdown".to_string()
            })
        );

        // Heartbeat is gone too
        tokio::time::sleep(Duration::from_secs(120)).await;
        settle().await;
        assert!(peer.written().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_watch_reports_transitions() {
        let connector = Arc::new(MockConnector::accepting());
        let manager = manager_with(&connector, test_config());
        let mut status = manager.status();

        manager.connect().await.unwrap();
        assert!(status.has_changed().unwrap());
        assert_eq!(*status.borrow_and_update(), ConnectionState::Connected);

        connector.take_peer().unwrap().close(Some(1011));
        settle().await;
        assert_eq!(
            *status.borrow_and_update(),
            ConnectionState::Reconnecting { attempt: 1 }
        );
    }
}
