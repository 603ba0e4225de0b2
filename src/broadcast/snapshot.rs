//! Snapshot cache and completed-task set

use std::collections::{HashMap, HashSet};

use crate::protocol::EventType;

/// Last-broadcast serialization per `(event type, entity id)`
#[derive(Debug, Default)]
pub struct SnapshotCache {
    entries: HashMap<EventType, HashMap<String, String>>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `serialized` differs from the cached value for this entity
    pub fn differs(&self, kind: EventType, id: &str, serialized: &str) -> bool {
        self.get(kind, id) != Some(serialized)
    }

    /// Store the newest serialization, replacing any previous one
    pub fn record(&mut self, kind: EventType, id: impl Into<String>, serialized: String) {
        self.entries
            .entry(kind)
            .or_default()
            .insert(id.into(), serialized);
    }

    pub fn get(&self, kind: EventType, id: &str) -> Option<&str> {
        self.entries
            .get(&kind)
            .and_then(|m| m.get(id))
            .map(String::as_str)
    }

    pub fn remove(&mut self, kind: EventType, id: &str) -> bool {
        self.entries
            .get_mut(&kind)
            .map(|m| m.remove(id).is_some())
            .unwrap_or(false)
    }

    /// Drop every entry of `kind` whose id is not in `live`; returns how many went
    pub fn retain(&mut self, kind: EventType, live: &HashSet<&str>) -> usize {
        let Some(map) = self.entries.get_mut(&kind) else {
            return 0;
        };
        let before = map.len();
        map.retain(|id, _| live.contains(id.as_str()));
        before - map.len()
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Ids of tasks already announced as completed
#[derive(Debug, Default)]
pub struct CompletedSet {
    ids: HashSet<String>,
}

impl CompletedSet {
    /// Add an id; `true` the first time it enters the set
    pub fn admit(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        self.ids.insert(id.to_string())
    }

    /// Forget ids that left the completed list so a re-completion announces again
    pub fn retain(&mut self, live: &HashSet<&str>) -> usize {
        let before = self.ids.len();
        self.ids.retain(|id| live.contains(id.as_str()));
        before - self.ids.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_differs_and_record() {
        let mut cache = SnapshotCache::new();
        assert!(cache.differs(EventType::WorkerStatus, "w1", "a"));

        cache.record(EventType::WorkerStatus, "w1", "a".to_string());
        assert!(!cache.differs(EventType::WorkerStatus, "w1", "a"));
        assert!(cache.differs(EventType::WorkerStatus, "w1", "b"));
        // Same id under another type is a separate entity
        assert!(cache.differs(EventType::BuildingUpdate, "w1", "a"));

        cache.record(EventType::WorkerStatus, "w1", "b".to_string());
        assert_eq!(cache.get(EventType::WorkerStatus, "w1"), Some("b"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_retain_drops_missing_entities() {
        let mut cache = SnapshotCache::new();
        cache.record(EventType::InventoryChange, "i1", "x".into());
        cache.record(EventType::InventoryChange, "i2", "y".into());
        cache.record(EventType::WorkerStatus, "i2", "z".into());

        let live: HashSet<&str> = ["i2"].into_iter().collect();
        assert_eq!(cache.retain(EventType::InventoryChange, &live), 1);
        assert!(cache.get(EventType::InventoryChange, "i1").is_none());
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.retain(EventType::AnalyticsUpdate, &live), 0);

        assert!(cache.remove(EventType::WorkerStatus, "i2"));
        assert!(!cache.remove(EventType::WorkerStatus, "i2"));
    }

    #[test]
    fn test_completed_set() {
        let mut done = CompletedSet::default();
        assert!(done.admit("t1"));
        assert!(!done.admit("t1"));

        assert_eq!(done.retain(&HashSet::new()), 1);
        assert!(done.is_empty());
        assert!(done.admit("t1"));
    }
}
