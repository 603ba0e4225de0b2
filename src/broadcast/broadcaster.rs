//! Change-Detection Broadcaster
//!
//! Samples the state source on a fixed interval and broadcasts an entity
//! only when its canonical payload differs from the last one broadcast.
//!
//! Each category is handled in two phases: every payload is encoded first,
//! then cache updates and publishes are applied. A category whose read (or
//! encoding) fails is skipped for the tick without touching its cache, and
//! the remaining categories still run.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::error::{BroadcastError, BroadcastResult};
use super::payload::{
    AnalyticsPayload, BuildingUpdatePayload, InventoryAlertPayload, TaskCompletedPayload,
    TaskUpdatePayload, WorkerStatusPayload,
};
use super::publisher::Publisher;
use super::snapshot::{CompletedSet, SnapshotCache};
use super::source::{Building, InventoryItem, StateSource, Task, Worker};
use crate::protocol::{EventType, Message};

/// Cache key of the single rolling analytics entity
const ANALYTICS_KEY: &str = "rolling";

/// Broadcaster timing and windows
#[derive(Debug, Clone)]
pub struct BroadcasterConfig {
    pub tick_interval: Duration,
    /// Analytics run on the first tick and then every this many ticks
    pub analytics_every_ticks: u32,
    pub analytics_window_days: i64,
    /// How far back completed tasks are looked up for completion announcements
    pub completion_lookback_hours: i64,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            analytics_every_ticks: 10,
            analytics_window_days: 7,
            completion_lookback_hours: 24,
        }
    }
}

/// Outcome of one tick
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub tick: u64,
    /// Messages broadcast during the tick, in publish order
    pub sent: Vec<Message>,
    /// Categories skipped because their read failed
    pub failed: Vec<&'static str>,
    pub analytics_ran: bool,
}

impl TickReport {
    pub fn count(&self, event_type: EventType) -> usize {
        self.sent
            .iter()
            .filter(|m| m.kind == event_type.as_str())
            .count()
    }

    fn fail(&mut self, category: &'static str, error: &dyn fmt::Display) {
        tracing::warn!(
            tick = self.tick,
            category,
            error = %error,
            "State read failed, skipping category this tick"
        );
        self.failed.push(category);
    }
}

/// One encoded entity, ready to compare against the cache
struct Encoded {
    id: String,
    data: Value,
    serialized: String,
}

fn encode<P: Serialize>(id: &str, payload: &P) -> Result<Encoded, serde_json::Error> {
    let data = serde_json::to_value(payload)?;
    let serialized = serde_json::to_string(&data)?;
    Ok(Encoded {
        id: id.to_string(),
        data,
        serialized,
    })
}

fn encode_all<'a, T, P, F>(
    items: impl IntoIterator<Item = &'a T>,
    id: impl Fn(&T) -> &str,
    build: F,
) -> Result<Vec<Encoded>, serde_json::Error>
where
    T: 'a,
    P: Serialize,
    F: Fn(&T) -> P,
{
    let mut encoded = items
        .into_iter()
        .map(|item| encode(id(item), &build(item)))
        .collect::<Result<Vec<_>, _>>()?;
    encoded.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(encoded)
}

#[derive(Default)]
struct Tracker {
    snapshots: SnapshotCache,
    completed: CompletedSet,
    ticks: u64,
}

struct Inner {
    config: BroadcasterConfig,
    source: Arc<dyn StateSource>,
    publisher: Publisher,
    /// Serializes ticks; timer and manual ticks never interleave
    tracker: tokio::sync::Mutex<Tracker>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

/// Handle to the change broadcaster
#[derive(Clone)]
pub struct ChangeBroadcaster {
    inner: Arc<Inner>,
}

impl ChangeBroadcaster {
    pub fn new(config: BroadcasterConfig, source: Arc<dyn StateSource>, publisher: Publisher) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                source,
                publisher,
                tracker: tokio::sync::Mutex::new(Tracker::default()),
                ticker: Mutex::new(None),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    /// Publisher used for broadcasts; exposes the manual `broadcast_*` wrappers
    pub fn publisher(&self) -> &Publisher {
        &self.inner.publisher
    }

    pub fn config(&self) -> &BroadcasterConfig {
        &self.inner.config
    }

    /// Start the periodic tick. The first tick runs immediately.
    pub fn start(&self) -> BroadcastResult<()> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(BroadcastError::Destroyed);
        }

        let mut ticker = self
            .inner
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if ticker.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return Err(BroadcastError::AlreadyRunning);
        }

        let period = self.inner.config.tick_interval.max(Duration::from_millis(1));
        let weak = Arc::downgrade(&self.inner);
        *ticker = Some(tokio::spawn(tick_loop(weak, period)));

        tracing::info!(
            interval_secs = period.as_secs_f64(),
            analytics_every = self.inner.config.analytics_every_ticks,
            "Change broadcaster started"
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Run one tick now
    pub async fn tick(&self) -> BroadcastResult<TickReport> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(BroadcastError::Destroyed);
        }
        Ok(self.inner.run_tick().await)
    }

    /// Ticks run so far
    pub async fn ticks(&self) -> u64 {
        self.inner.tracker.lock().await.ticks
    }

    /// Number of cached snapshots across all entity types
    pub async fn cached_snapshots(&self) -> usize {
        self.inner.tracker.lock().await.snapshots.len()
    }

    /// Stop the timer. Safe to call more than once.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self
            .inner
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        tracing::info!("Change broadcaster destroyed");
    }
}

async fn tick_loop(inner: Weak<Inner>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if inner.destroyed.load(Ordering::SeqCst) {
            break;
        }
        inner.run_tick().await;
    }
}

impl Inner {
    async fn run_tick(&self) -> TickReport {
        let mut tracker = self.tracker.lock().await;
        tracker.ticks += 1;
        let mut report = TickReport {
            tick: tracker.ticks,
            ..TickReport::default()
        };
        let now = Utc::now();

        let tasks = self.source.tasks().await;
        match &tasks {
            Ok(tasks) => {
                let open = tasks.iter().filter(|t| !t.is_completed());
                match encode_all(open, |t: &Task| t.id.as_str(), |t: &Task| TaskUpdatePayload::from(t)) {
                    Ok(encoded) => self.apply(&mut tracker, EventType::TaskUpdated, encoded, &mut report),
                    Err(e) => report.fail("tasks", &e),
                }
            }
            Err(e) => report.fail("tasks", e),
        }

        let since = now - chrono::Duration::hours(self.config.completion_lookback_hours);
        match self.source.completed_tasks_since(since).await {
            Ok(done) => match encode_all(&done, |t: &Task| t.id.as_str(), |t: &Task| {
                TaskCompletedPayload::from(t)
            }) {
                Ok(encoded) => self.apply_completions(&mut tracker, encoded, &mut report),
                Err(e) => report.fail("completions", &e),
            },
            Err(e) => report.fail("completions", &e),
        }

        match (self.source.workers().await, &tasks) {
            (Ok(workers), Ok(tasks)) => {
                match encode_all(&workers, |w: &Worker| w.id.as_str(), |w: &Worker| {
                    WorkerStatusPayload::new(w, tasks)
                }) {
                    Ok(encoded) => self.apply(&mut tracker, EventType::WorkerStatus, encoded, &mut report),
                    Err(e) => report.fail("workers", &e),
                }
            }
            (Err(e), _) => report.fail("workers", &e),
            (Ok(_), Err(e)) => report.fail("workers", e),
        }

        match self.source.buildings().await {
            Ok(buildings) => {
                match encode_all(&buildings, |b: &Building| b.id.as_str(), |b: &Building| {
                    BuildingUpdatePayload::from(b)
                }) {
                    Ok(encoded) => self.apply(&mut tracker, EventType::BuildingUpdate, encoded, &mut report),
                    Err(e) => report.fail("buildings", &e),
                }
            }
            Err(e) => report.fail("buildings", &e),
        }

        match self.source.low_stock_inventory().await {
            Ok(items) => {
                match encode_all(&items, |i: &InventoryItem| i.id.as_str(), |i: &InventoryItem| {
                    InventoryAlertPayload::from(i)
                }) {
                    Ok(encoded) => self.apply(&mut tracker, EventType::InventoryChange, encoded, &mut report),
                    Err(e) => report.fail("inventory", &e),
                }
            }
            Err(e) => report.fail("inventory", &e),
        }

        let every = u64::from(self.config.analytics_every_ticks.max(1));
        if (report.tick - 1) % every == 0 {
            report.analytics_ran = true;
            let window = self.config.analytics_window_days;
            let since = now - chrono::Duration::days(window);
            match self.source.completed_tasks_since(since).await {
                Ok(done) => match encode(ANALYTICS_KEY, &AnalyticsPayload::rollup(window, &done)) {
                    Ok(encoded) => {
                        self.apply(&mut tracker, EventType::AnalyticsUpdate, vec![encoded], &mut report)
                    }
                    Err(e) => report.fail("analytics", &e),
                },
                Err(e) => report.fail("analytics", &e),
            }
        }

        tracing::debug!(
            tick = report.tick,
            sent = report.sent.len(),
            failed = report.failed.len(),
            "Broadcast tick finished"
        );
        report
    }

    /// Diff encoded entities of one type against the cache and publish the changes
    ///
    /// Entities of `kind` absent from `encoded` lose their snapshot, so they
    /// broadcast again if they come back.
    fn apply(&self, tracker: &mut Tracker, kind: EventType, encoded: Vec<Encoded>, report: &mut TickReport) {
        let live: HashSet<&str> = encoded.iter().map(|e| e.id.as_str()).collect();
        let dropped = tracker.snapshots.retain(kind, &live);
        if dropped > 0 {
            tracing::debug!(kind = %kind, dropped, "Snapshots dropped for entities no longer present");
        }

        for entry in encoded {
            if !tracker.snapshots.differs(kind, &entry.id, &entry.serialized) {
                continue;
            }
            let message = self.publisher.publish(kind, entry.data);
            tracker.snapshots.record(kind, entry.id, entry.serialized);
            report.sent.push(message);
        }
    }

    fn apply_completions(&self, tracker: &mut Tracker, encoded: Vec<Encoded>, report: &mut TickReport) {
        let live: HashSet<&str> = encoded.iter().map(|e| e.id.as_str()).collect();
        let reopened = tracker.completed.retain(&live);
        if reopened > 0 {
            tracing::debug!(reopened, "Tasks left the completed set");
        }

        for entry in encoded {
            if tracker.completed.admit(&entry.id) {
                report
                    .sent
                    .push(self.publisher.publish(EventType::TaskCompleted, entry.data));
            }
        }
    }
}
