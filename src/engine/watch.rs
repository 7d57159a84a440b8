//! Which workers are waiting on which provenance prefixes.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::model::ProvenanceChain;
use crate::worker::Worker;

/// Registry of join watchers, keyed by prefix. A worker appears at most once
/// per prefix; identity is the worker's name.
#[derive(Default)]
pub struct WatchRegistry {
    watchers: Mutex<HashMap<ProvenanceChain, Vec<Arc<dyn Worker>>>>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `worker` on `prefix`. Returns false if it was already registered.
    pub fn watch(&self, prefix: ProvenanceChain, worker: Arc<dyn Worker>) -> bool {
        let mut watchers = self.watchers.lock();
        let entry = watchers.entry(prefix).or_default();
        if entry.iter().any(|w| w.name() == worker.name()) {
            return false;
        }
        entry.push(worker);
        true
    }

    /// Remove the registration. Returns whether it was present.
    pub fn unwatch(&self, prefix: &ProvenanceChain, worker: &str) -> bool {
        let mut watchers = self.watchers.lock();
        let Some(entry) = watchers.get_mut(prefix) else {
            return false;
        };

        let before = entry.len();
        entry.retain(|w| w.name() != worker);
        let removed = entry.len() != before;

        if entry.is_empty() {
            watchers.remove(prefix);
        }
        removed
    }

    /// Workers currently watching `prefix`, in registration order.
    pub fn watchers(&self, prefix: &ProvenanceChain) -> Vec<Arc<dyn Worker>> {
        self.watchers
            .lock()
            .get(prefix)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_watching(&self, prefix: &ProvenanceChain, worker: &str) -> bool {
        self.watchers
            .lock()
            .get(prefix)
            .is_some_and(|entry| entry.iter().any(|w| w.name() == worker))
    }

    /// Number of prefixes with at least one watcher.
    pub fn len(&self) -> usize {
        self.watchers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.watchers.lock().is_empty()
    }
}
