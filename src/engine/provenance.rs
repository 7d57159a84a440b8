//! Reference counts per provenance prefix.
//!
//! Every queued or running task holds one reference on each non-empty prefix
//! of its chain. A prefix whose count drops to zero is removed and reported
//! as released; that removal is the join signal.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::warn;

use crate::model::ProvenanceChain;

#[derive(Debug, Default)]
pub struct ProvenanceTracker {
    counts: Mutex<HashMap<ProvenanceChain, usize>>,
}

impl ProvenanceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take one reference on every prefix of `chain`.
    pub fn add(&self, chain: &ProvenanceChain) {
        let mut counts = self.counts.lock();
        increment(&mut counts, chain);
    }

    /// Take references for several chains in one critical section.
    pub fn add_all<'a, I>(&self, chains: I)
    where
        I: IntoIterator<Item = &'a ProvenanceChain>,
    {
        let mut counts = self.counts.lock();
        for chain in chains {
            increment(&mut counts, chain);
        }
    }

    /// Drop one reference on every prefix of `chain` and return the prefixes
    /// released by this call, shortest first.
    pub fn remove(&self, chain: &ProvenanceChain) -> Vec<ProvenanceChain> {
        let mut counts = self.counts.lock();
        let mut released = Vec::new();

        for prefix in chain.prefixes() {
            match counts.get_mut(&prefix) {
                Some(count) if *count > 1 => *count -= 1,
                Some(_) => {
                    counts.remove(&prefix);
                    released.push(prefix);
                }
                None => {
                    warn!(provenance = %prefix, "removing untracked provenance prefix");
                }
            }
        }

        released
    }

    /// Current count for `prefix`; 0 when untracked.
    pub fn count(&self, prefix: &ProvenanceChain) -> usize {
        self.counts.lock().get(prefix).copied().unwrap_or(0)
    }

    pub fn is_tracked(&self, prefix: &ProvenanceChain) -> bool {
        self.counts.lock().contains_key(prefix)
    }

    /// Number of tracked prefixes.
    pub fn len(&self) -> usize {
        self.counts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.lock().is_empty()
    }
}

fn increment(counts: &mut HashMap<ProvenanceChain, usize>, chain: &ProvenanceChain) {
    for prefix in chain.prefixes() {
        *counts.entry(prefix).or_insert(0) += 1;
    }
}
