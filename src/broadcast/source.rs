//! State Sources
//!
//! Read-only view of operational state sampled by the broadcaster each tick.
//! The persistence layer lives elsewhere; this module only defines the
//! records it hands over and two simple sources (in-memory and JSON file).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use super::error::SourceResult;

/// Lifecycle of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub building_id: Option<String>,
    #[serde(default)]
    pub due_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Worker {
    pub id: String,
    pub name: String,
    /// Free-form status as shown to dispatchers, e.g. "Available" or "In Progress"
    pub status: String,
    #[serde(default)]
    pub current_building_id: Option<String>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Building {
    pub id: String,
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub open_issues: u32,
    #[serde(default)]
    pub compliance_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryItem {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub building_id: Option<String>,
    pub quantity: u32,
    pub min_quantity: u32,
    #[serde(default)]
    pub unit: Option<String>,
}

impl InventoryItem {
    pub fn is_low_stock(&self) -> bool {
        self.quantity <= self.min_quantity
    }
}

/// Read-only access to current operational state
#[async_trait]
pub trait StateSource: Send + Sync {
    async fn tasks(&self) -> SourceResult<Vec<Task>>;

    async fn workers(&self) -> SourceResult<Vec<Worker>>;

    async fn buildings(&self) -> SourceResult<Vec<Building>>;

    /// Items at or below their minimum quantity
    async fn low_stock_inventory(&self) -> SourceResult<Vec<InventoryItem>>;

    /// Tasks completed at or after `since`, plus completed tasks with no timestamp
    async fn completed_tasks_since(&self, since: DateTime<Utc>) -> SourceResult<Vec<Task>>;
}

/// Full state document, the shape read by [`JsonFileSource`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub workers: Vec<Worker>,
    #[serde(default)]
    pub buildings: Vec<Building>,
    #[serde(default)]
    pub inventory: Vec<InventoryItem>,
}

impl StateDocument {
    pub fn low_stock(&self) -> Vec<InventoryItem> {
        self.inventory
            .iter()
            .filter(|item| item.is_low_stock())
            .cloned()
            .collect()
    }

    /// Completed tasks inside the window; an undated completion always counts
    pub fn completed_since(&self, since: DateTime<Utc>) -> Vec<Task> {
        self.tasks
            .iter()
            .filter(|t| t.is_completed() && t.completed_at.map(|at| at >= since).unwrap_or(true))
            .cloned()
            .collect()
    }
}

/// State held in memory; the embedding application pushes updates into it
#[derive(Debug, Default)]
pub struct MemorySource {
    document: RwLock<StateDocument>,
}

impl MemorySource {
    pub fn new(document: StateDocument) -> Self {
        Self {
            document: RwLock::new(document),
        }
    }

    pub fn replace(&self, document: StateDocument) {
        *self.document.write().unwrap_or_else(PoisonError::into_inner) = document;
    }

    pub fn update<F: FnOnce(&mut StateDocument)>(&self, f: F) {
        f(&mut self.document.write().unwrap_or_else(PoisonError::into_inner));
    }

    fn read<T>(&self, f: impl FnOnce(&StateDocument) -> T) -> T {
        f(&self.document.read().unwrap_or_else(PoisonError::into_inner))
    }
}

#[async_trait]
impl StateSource for MemorySource {
    async fn tasks(&self) -> SourceResult<Vec<Task>> {
        Ok(self.read(|d| d.tasks.clone()))
    }

    async fn workers(&self) -> SourceResult<Vec<Worker>> {
        Ok(self.read(|d| d.workers.clone()))
    }

    async fn buildings(&self) -> SourceResult<Vec<Building>> {
        Ok(self.read(|d| d.buildings.clone()))
    }

    async fn low_stock_inventory(&self) -> SourceResult<Vec<InventoryItem>> {
        Ok(self.read(StateDocument::low_stock))
    }

    async fn completed_tasks_since(&self, since: DateTime<Utc>) -> SourceResult<Vec<Task>> {
        Ok(self.read(|d| d.completed_since(since)))
    }
}

/// Re-reads a JSON state document on every call
///
/// Lets the binary run against a file that some other process keeps
/// up to date.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> SourceResult<StateDocument> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[async_trait]
impl StateSource for JsonFileSource {
    async fn tasks(&self) -> SourceResult<Vec<Task>> {
        Ok(self.load().await?.tasks)
    }

    async fn workers(&self) -> SourceResult<Vec<Worker>> {
        Ok(self.load().await?.workers)
    }

    async fn buildings(&self) -> SourceResult<Vec<Building>> {
        Ok(self.load().await?.buildings)
    }

    async fn low_stock_inventory(&self) -> SourceResult<Vec<InventoryItem>> {
        Ok(self.load().await?.low_stock())
    }

    async fn completed_tasks_since(&self, since: DateTime<Utc>) -> SourceResult<Vec<Task>> {
        Ok(self.load().await?.completed_since(since))
    }
}
