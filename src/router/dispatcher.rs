//! Message Router
//!
//! Turns inbound messages into permissioned, ordered side effects.
//!
//! Every command (dispatch, route changes, context updates, retries) goes
//! through one queue drained by a single worker task that owns the route
//! table and the recipient context. Messages are therefore handled strictly
//! in arrival order, and handler side effects never interleave.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};

use super::context::{self, RecipientContext};
use super::error::{RouterError, RouterResult};
use super::route::{Route, RouteTable};
use crate::events::isolate;
use crate::protocol::Message;

/// Configuration for the message router
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Fixed delay before the single retry of a retryable handler
    pub retry_delay: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Counters exposed for status displays and tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RouterStats {
    /// Messages taken off the queue
    pub received: u64,
    /// Messages withheld by the permission check
    pub denied: u64,
    /// Successful handler invocations
    pub handled: u64,
    /// Failed handler invocations, retries included
    pub failed: u64,
    /// Retries scheduled
    pub retried: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    denied: AtomicU64,
    handled: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> RouterStats {
        RouterStats {
            received: self.received.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            handled: self.handled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
        }
    }
}

enum Command {
    Dispatch(Message),
    AddRoute(Route),
    RemoveRoute(String),
    UpdateContext(Option<RecipientContext>),
    Retry { route: Route, message: Message },
    Drain(oneshot::Sender<()>),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Attempt {
    First,
    Retry,
}

/// Handle to the router worker
///
/// Cheap to clone; all clones feed the same queue.
#[derive(Clone)]
pub struct MessageRouter {
    commands: mpsc::UnboundedSender<Command>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
    stopped: Arc<AtomicBool>,
    next_route: Arc<AtomicU64>,
    counters: Arc<Counters>,
}

impl MessageRouter {
    /// Start the worker task. Must be called inside a tokio runtime.
    pub fn spawn(config: RouterConfig) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());

        let worker = Worker {
            routes: RouteTable::default(),
            context: None,
            retry_delay: config.retry_delay,
            retries: JoinSet::new(),
            commands: commands.downgrade(),
            counters: Arc::clone(&counters),
        };
        let handle = tokio::spawn(worker.run(receiver));

        Self {
            commands,
            worker: Arc::new(Mutex::new(Some(handle))),
            stopped: Arc::new(AtomicBool::new(false)),
            next_route: Arc::new(AtomicU64::new(1)),
            counters,
        }
    }

    fn submit(&self, command: Command) -> RouterResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RouterError::Stopped);
        }
        self.commands.send(command).map_err(|_| RouterError::Stopped)
    }

    /// Register a handler for a message type
    ///
    /// Handlers for the same type run in descending `priority` order. A
    /// `retryable` handler that fails is invoked once more after the
    /// configured retry delay.
    pub fn add_route<F>(
        &self,
        kind: impl Into<String>,
        handler: F,
        priority: i32,
        retryable: bool,
    ) -> RouterResult<String>
    where
        F: Fn(&Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = format!("route-{}", self.next_route.fetch_add(1, Ordering::Relaxed));
        self.register(Route {
            id: id.clone(),
            kind: kind.into(),
            handler: Arc::new(handler),
            priority,
            retryable,
        })?;
        Ok(id)
    }

    /// Register a fully built route; an existing route with the same id is replaced
    pub fn register(&self, route: Route) -> RouterResult<()> {
        self.submit(Command::AddRoute(route))
    }

    pub fn remove_route(&self, id: impl Into<String>) -> RouterResult<()> {
        self.submit(Command::RemoveRoute(id.into()))
    }

    /// Queue an inbound message for processing
    pub fn enqueue(&self, message: Message) -> RouterResult<()> {
        self.submit(Command::Dispatch(message))
    }

    /// Replace the recipient context used by subsequent permission checks
    ///
    /// Messages queued before this call are checked against the previous
    /// context.
    pub fn update_context(&self, context: RecipientContext) -> RouterResult<()> {
        self.submit(Command::UpdateContext(Some(context)))
    }

    /// Remove the context; every taxonomy message is withheld until a new one is set
    pub fn clear_context(&self) -> RouterResult<()> {
        self.submit(Command::UpdateContext(None))
    }

    /// Wait until every command queued before this call has been processed
    pub async fn drain(&self) -> RouterResult<()> {
        let (tx, rx) = oneshot::channel();
        self.submit(Command::Drain(tx))?;
        rx.await.map_err(|_| RouterError::Stopped)
    }

    pub fn stats(&self) -> RouterStats {
        self.counters.snapshot()
    }

    /// Stop the worker and cancel pending retries. Safe to call more than once.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        tracing::debug!("Message router shut down");
    }
}

struct Worker {
    routes: RouteTable,
    context: Option<RecipientContext>,
    retry_delay: Duration,
    /// Pending retry timers; dropped (and aborted) with the worker
    retries: JoinSet<()>,
    commands: mpsc::WeakUnboundedSender<Command>,
    counters: Arc<Counters>,
}

impl Worker {
    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<Command>) {
        loop {
            let command = tokio::select! {
                Some(_) = self.retries.join_next(), if !self.retries.is_empty() => continue,
                command = receiver.recv() => command,
            };

            match command {
                Some(command) => self.handle(command),
                None => break,
            }
        }
        tracing::debug!("Message router worker stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Dispatch(message) => self.process(&message),
            Command::AddRoute(route) => {
                let (id, kind, priority) = (route.id.clone(), route.kind.clone(), route.priority);
                self.routes.insert(route);
                tracing::debug!(
                    route_id = %id,
                    kind = %kind,
                    priority,
                    total = self.routes.len(),
                    "Route registered"
                );
            }
            Command::RemoveRoute(id) => {
                if self.routes.remove(&id) {
                    tracing::debug!(route_id = %id, "Route removed");
                }
            }
            Command::UpdateContext(context) => {
                tracing::info!(
                    user_id = context.as_ref().map(|c| c.user_id.as_str()).unwrap_or("-"),
                    role = context.as_ref().map(|c| c.user_role.as_str()).unwrap_or("-"),
                    "Recipient context updated"
                );
                self.context = context;
            }
            Command::Retry { route, message } => self.invoke(&route, &message, Attempt::Retry),
            Command::Drain(done) => {
                let _ = done.send(());
            }
        }
    }

    fn process(&mut self, message: &Message) {
        Counters::bump(&self.counters.received);

        if let Err(denial) = context::check(self.context.as_ref(), message) {
            Counters::bump(&self.counters.denied);
            tracing::debug!(kind = %message.kind, id = ?message.id, reason = %denial, "Message withheld");
            return;
        }

        let routes = self.routes.routes_for(&message.kind).to_vec();
        if routes.is_empty() {
            tracing::trace!(kind = %message.kind, "No route for message");
            return;
        }

        for route in &routes {
            self.invoke(route, message, Attempt::First);
        }
    }

    fn invoke(&mut self, route: &Route, message: &Message, attempt: Attempt) {
        let result = isolate(|| (route.handler)(message));

        let error = match result {
            Ok(()) => {
                Counters::bump(&self.counters.handled);
                return;
            }
            Err(e) => e,
        };
        Counters::bump(&self.counters.failed);

        match attempt {
            Attempt::First if route.retryable => {
                tracing::warn!(
                    route_id = %route.id,
                    kind = %message.kind,
                    error = %error,
                    retry_in_ms = self.retry_delay.as_millis() as u64,
                    "Handler failed, retrying once"
                );
                self.schedule_retry(route.clone(), message.clone());
            }
            Attempt::First => {
                tracing::warn!(route_id = %route.id, kind = %message.kind, error = %error, "Handler failed");
            }
            Attempt::Retry => {
                tracing::warn!(
                    route_id = %route.id,
                    kind = %message.kind,
                    error = %error,
                    "Handler failed on retry, dropping message"
                );
            }
        }
    }

    fn schedule_retry(&mut self, route: Route, message: Message) {
        Counters::bump(&self.counters.retried);
        let commands = self.commands.clone();
        let delay = self.retry_delay;

        self.retries.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::Retry { route, message });
            }
        });
    }
}
