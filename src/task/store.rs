//! Task Store (spec §4.4): concurrency-safe `task id -> Task Handle` map.
//!
//! Generalizes the teacher's `Manager` (`server/manager.rs`, `DashMap<
//! String, Arc<Server>>`) from "server UUID -> Server" to "task id -> Task
//! Handle."

use std::sync::Arc;

use dashmap::DashMap;

use super::handle::TaskHandle;

#[derive(Default)]
pub struct TaskStore {
    handles: DashMap<String, Arc<TaskHandle>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self { handles: DashMap::new() }
    }

    pub fn set(&self, task_id: &str, handle: Arc<TaskHandle>) {
        self.handles.insert(task_id.to_string(), handle);
    }

    pub fn get(&self, task_id: &str) -> Option<Arc<TaskHandle>> {
        self.handles.get(task_id).map(|r| r.value().clone())
    }

    pub fn delete(&self, task_id: &str) -> Option<Arc<TaskHandle>> {
        self.handles.remove(task_id).map(|(_, handle)| handle)
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.handles.contains_key(task_id)
    }

    /// Snapshot of every live container id, for startup reconciliation.
    pub fn container_ids(&self) -> Vec<String> {
        self.handles.iter().map(|r| r.value().container_id().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::handle::HandleState;

    fn handle(container_id: &str) -> Arc<TaskHandle> {
        Arc::new(TaskHandle::new_for_test(container_id))
    }

    #[test]
    fn set_get_delete_round_trip() {
        let store = TaskStore::new();
        assert!(store.get("t1").is_none());

        store.set("t1", handle("c1"));
        assert!(store.contains("t1"));
        assert_eq!(store.get("t1").unwrap().container_id(), "c1");

        let removed = store.delete("t1").unwrap();
        assert_eq!(removed.container_id(), "c1");
        assert!(!store.contains("t1"));
    }

    #[test]
    fn container_ids_is_a_snapshot() {
        let store = TaskStore::new();
        store.set("t1", handle("c1"));
        store.set("t2", handle("c2"));

        let mut ids = store.container_ids();
        ids.sort();
        assert_eq!(ids, vec!["c1".to_string(), "c2".to_string()]);
        assert_eq!(store.get("t1").unwrap().state(), HandleState::Created);
    }
}
