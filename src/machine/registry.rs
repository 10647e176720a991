//! Live runtime handle registry.
//!
//! Maps machine id to the driver instance that owns the spawned process, so
//! stop/exec after start can reach it. Inserted only after a successful
//! start, removed on stop or delete; constructed once at daemon init and
//! injected wherever it is needed.

use std::sync::Arc;

use dashmap::DashMap;

use crate::runtime::RuntimeDriver;

#[derive(Default)]
pub struct RuntimeRegistry {
    handles: DashMap<String, Arc<dyn RuntimeDriver>>,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
        }
    }

    pub fn insert(&self, machine_id: impl Into<String>, driver: Arc<dyn RuntimeDriver>) {
        self.handles.insert(machine_id.into(), driver);
    }

    pub fn get(&self, machine_id: &str) -> Option<Arc<dyn RuntimeDriver>> {
        self.handles.get(machine_id).map(|r| Arc::clone(r.value()))
    }

    pub fn remove(&self, machine_id: &str) -> Option<Arc<dyn RuntimeDriver>> {
        self.handles.remove(machine_id).map(|(_, driver)| driver)
    }

    pub fn contains(&self, machine_id: &str) -> bool {
        self.handles.contains_key(machine_id)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn machine_ids(&self) -> Vec<String> {
        self.handles.iter().map(|r| r.key().clone()).collect()
    }
}

impl std::fmt::Debug for RuntimeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeRegistry")
            .field("handles", &self.machine_ids())
            .finish()
    }
}
