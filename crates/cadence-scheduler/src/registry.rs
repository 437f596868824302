use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::engine::WorkerEntry;

/// Concurrent name → worker map. The only state shared across workers.
///
/// Cheap to clone; clones share the same map.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    workers: Arc<DashMap<String, Arc<WorkerEntry>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace; returns the previous entry.
    pub fn put(&self, entry: Arc<WorkerEntry>) -> Option<Arc<WorkerEntry>> {
        self.workers.insert(entry.name().to_string(), entry)
    }

    /// Insert unless the name is taken; hands the entry back if it is.
    pub fn insert_if_absent(
        &self,
        entry: Arc<WorkerEntry>,
    ) -> std::result::Result<(), Arc<WorkerEntry>> {
        match self.workers.entry(entry.name().to_string()) {
            Entry::Occupied(_) => Err(entry),
            Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<WorkerEntry>> {
        self.workers.get(name).map(|e| Arc::clone(e.value()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workers.contains_key(name)
    }

    pub fn remove(&self, name: &str) -> Option<Arc<WorkerEntry>> {
        self.workers.remove(name).map(|(_, entry)| entry)
    }

    /// Remove `entry` only if it is still the one registered under its name.
    pub fn remove_entry(&self, entry: &Arc<WorkerEntry>) -> bool {
        self.workers
            .remove_if(entry.name().as_str(), |_, current| Arc::ptr_eq(current, entry))
            .is_some()
    }

    /// Name-ordered copy of the current entries.
    pub fn snapshot(&self) -> BTreeMap<String, Arc<WorkerEntry>> {
        self.workers
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
