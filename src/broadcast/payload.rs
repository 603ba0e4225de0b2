//! Canonical broadcast payloads
//!
//! Each payload is a fixed-shape struct built from source records. Anything
//! that varies with read order (assignment lists, rollup buckets) is sorted
//! or counted so the same logical state always serializes the same way.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use super::source::{Building, InventoryItem, Task, TaskStatus, Worker};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdatePayload {
    pub task_id: String,
    pub title: String,
    pub status: TaskStatus,
    pub worker_id: Option<String>,
    pub building_id: Option<String>,
    pub due_at: Option<DateTime<Utc>>,
}

impl From<&Task> for TaskUpdatePayload {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            title: task.title.clone(),
            status: task.status,
            worker_id: task.worker_id.clone(),
            building_id: task.building_id.clone(),
            due_at: task.due_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCompletedPayload {
    pub task_id: String,
    pub title: String,
    pub worker_id: Option<String>,
    pub building_id: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Task> for TaskCompletedPayload {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            title: task.title.clone(),
            worker_id: task.worker_id.clone(),
            building_id: task.building_id.clone(),
            completed_at: task.completed_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatusPayload {
    pub worker_id: String,
    pub status: String,
    pub current_building: Option<String>,
    /// Lowest id among the worker's in-progress tasks
    pub active_task: Option<String>,
    pub pending_tasks: usize,
    pub last_seen: Option<DateTime<Utc>>,
}

impl WorkerStatusPayload {
    /// Build from a worker and the full task list
    pub fn new(worker: &Worker, tasks: &[Task]) -> Self {
        let assigned = || {
            tasks
                .iter()
                .filter(move |t| t.worker_id.as_deref() == Some(worker.id.as_str()))
        };

        let active_task = assigned()
            .filter(|t| t.status == TaskStatus::InProgress)
            .map(|t| t.id.clone())
            .min();
        let pending_tasks = assigned()
            .filter(|t| t.status == TaskStatus::Pending)
            .count();

        Self {
            worker_id: worker.id.clone(),
            status: worker.status.clone(),
            current_building: worker.current_building_id.clone(),
            active_task,
            pending_tasks,
            last_seen: worker.last_seen,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildingUpdatePayload {
    pub building_id: String,
    pub name: String,
    pub status: String,
    pub open_issues: u32,
    pub compliance_score: Option<f64>,
}

impl From<&Building> for BuildingUpdatePayload {
    fn from(building: &Building) -> Self {
        Self {
            building_id: building.id.clone(),
            name: building.name.clone(),
            status: building.status.clone(),
            open_issues: building.open_issues,
            compliance_score: building.compliance_score,
        }
    }
}

/// Low-stock alert; the whole payload is the dedup key
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryAlertPayload {
    pub item_id: String,
    pub name: String,
    pub building_id: Option<String>,
    pub quantity: u32,
    pub min_quantity: u32,
    pub unit: Option<String>,
}

impl From<&InventoryItem> for InventoryAlertPayload {
    fn from(item: &InventoryItem) -> Self {
        Self {
            item_id: item.id.clone(),
            name: item.name.clone(),
            building_id: item.building_id.clone(),
            quantity: item.quantity,
            min_quantity: item.min_quantity,
            unit: item.unit.clone(),
        }
    }
}

/// Completions over a rolling window, grouped three ways
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsPayload {
    pub window_days: i64,
    pub total_completed: usize,
    pub by_worker: BTreeMap<String, usize>,
    pub by_building: BTreeMap<String, usize>,
    /// Keyed by `YYYY-MM-DD` (UTC)
    pub by_day: BTreeMap<String, usize>,
}

/// Bucket key for completions with no worker or building
pub const UNASSIGNED: &str = "unassigned";

impl AnalyticsPayload {
    pub fn rollup(window_days: i64, completed: &[Task]) -> Self {
        let mut by_worker = BTreeMap::new();
        let mut by_building = BTreeMap::new();
        let mut by_day = BTreeMap::new();

        for task in completed {
            let worker = task.worker_id.as_deref().unwrap_or(UNASSIGNED).to_string();
            let building = task.building_id.as_deref().unwrap_or(UNASSIGNED).to_string();
            *by_worker.entry(worker).or_insert(0) += 1;
            *by_building.entry(building).or_insert(0) += 1;
            if let Some(at) = task.completed_at {
                *by_day.entry(at.format("%Y-%m-%d").to_string()).or_insert(0) += 1;
            }
        }

        Self {
            window_days,
            total_completed: completed.len(),
            by_worker,
            by_building,
            by_day,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, status: TaskStatus, worker: Option<&str>) -> Task {
        Task {
            id: id.into(),
            title: format!("task {}", id),
            status,
            worker_id: worker.map(Into::into),
            building_id: None,
            due_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn test_worker_payload_independent_of_task_order() {
        let worker = Worker {
            id: "w1".into(),
            name: "Ana".into(),
            status: "In Progress".into(),
            current_building_id: Some("b1".into()),
            last_seen: None,
        };
        let mut tasks = vec![
            task("t3", TaskStatus::InProgress, Some("w1")),
            task("t1", TaskStatus::InProgress, Some("w1")),
            task("t2", TaskStatus::Pending, Some("w1")),
            task("t4", TaskStatus::Pending, Some("w2")),
        ];

        let forward = WorkerStatusPayload::new(&worker, &tasks);
        tasks.reverse();
        let backward = WorkerStatusPayload::new(&worker, &tasks);

        assert_eq!(forward, backward);
        assert_eq!(forward.active_task.as_deref(), Some("t1"));
        assert_eq!(forward.pending_tasks, 1);
        assert_eq!(
            serde_json::to_string(&forward).unwrap(),
            serde_json::to_string(&backward).unwrap()
        );
    }

    #[test]
    fn test_worker_payload_field_names() {
        let worker = Worker {
            id: "w1".into(),
            name: "Ana".into(),
            status: "Available".into(),
            current_building_id: None,
            last_seen: None,
        };
        let value = serde_json::to_value(WorkerStatusPayload::new(&worker, &[])).unwrap();
        for field in ["workerId", "status", "currentBuilding", "activeTask", "pendingTasks", "lastSeen"] {
            assert!(value.get(field).is_some(), "missing {}", field);
        }
    }

    #[test]
    fn test_analytics_rollup() {
        let mut a = task("t1", TaskStatus::Completed, Some("w1"));
        a.completed_at = Some("2026-03-02T10:00:00Z".parse().unwrap());
        a.building_id = Some("b1".into());
        let mut b = task("t2", TaskStatus::Completed, None);
        b.completed_at = Some("2026-03-02T23:59:00Z".parse().unwrap());

        let rollup = AnalyticsPayload::rollup(7, &[a, b]);
        assert_eq!(rollup.total_completed, 2);
        assert_eq!(rollup.by_worker["w1"], 1);
        assert_eq!(rollup.by_worker[UNASSIGNED], 1);
        assert_eq!(rollup.by_building["b1"], 1);
        assert_eq!(rollup.by_day["2026-03-02"], 2);
    }
}
