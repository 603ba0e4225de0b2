//! Route Table

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::protocol::Message;

/// Handler invoked for a routed message
pub type RouteHandler = Arc<dyn Fn(&Message) -> anyhow::Result<()> + Send + Sync>;

/// A `(type, handler, priority, retryable)` registration
#[derive(Clone)]
pub struct Route {
    pub id: String,
    /// Message type this route handles
    pub kind: String,
    pub handler: RouteHandler,
    /// Higher runs first
    pub priority: i32,
    /// Retry once after a failure
    pub retryable: bool,
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("priority", &self.priority)
            .field("retryable", &self.retryable)
            .finish()
    }
}

/// Routes grouped by message type, each list sorted by descending priority
#[derive(Default)]
pub(crate) struct RouteTable {
    routes: HashMap<String, Vec<Route>>,
}

impl RouteTable {
    /// Insert and re-sort. Equal priorities keep registration order.
    pub(crate) fn insert(&mut self, route: Route) {
        self.remove(&route.id);
        let list = self.routes.entry(route.kind.clone()).or_default();
        list.push(route);
        list.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    pub(crate) fn remove(&mut self, id: &str) -> bool {
        let mut removed = false;
        self.routes.retain(|_, list| {
            let before = list.len();
            list.retain(|r| r.id != id);
            removed |= list.len() != before;
            !list.is_empty()
        });
        removed
    }

    pub(crate) fn routes_for(&self, kind: &str) -> &[Route] {
        self.routes.get(kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn len(&self) -> usize {
        self.routes.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(id: &str, kind: &str, priority: i32) -> Route {
        Route {
            id: id.to_string(),
            kind: kind.to_string(),
            handler: Arc::new(|_| Ok(())),
            priority,
            retryable: false,
        }
    }

    #[test]
    fn test_insert_keeps_descending_priority() {
        let mut table = RouteTable::default();
        table.insert(route("low", "task_completed", 5));
        table.insert(route("high", "task_completed", 10));
        table.insert(route("mid", "task_completed", 7));
        table.insert(route("mid2", "task_completed", 7));

        let ids: Vec<_> = table
            .routes_for("task_completed")
            .iter()
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(ids, vec!["high", "mid", "mid2", "low"]);
    }

    #[test]
    fn test_remove_route() {
        let mut table = RouteTable::default();
        table.insert(route("a", "emergency", 1));
        table.insert(route("b", "worker_status", 1));
        assert_eq!(table.len(), 2);

        assert!(table.remove("a"));
        assert!(!table.remove("a"));
        assert!(table.routes_for("emergency").is_empty());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_reinsert_same_id_replaces() {
        let mut table = RouteTable::default();
        table.insert(route("a", "emergency", 1));
        table.insert(route("a", "emergency", 9));
        assert_eq!(table.routes_for("emergency").len(), 1);
        assert_eq!(table.routes_for("emergency")[0].priority, 9);
    }
}
