//! Core data model.
//!
//! A task is a unit of work flowing between workers. It carries a payload,
//! the provenance chain recording which (worker, id) pairs produced it, the
//! ancestor tasks it was derived from, and a retry counter owned by the
//! dispatcher.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Provenance
// ---------------------------------------------------------------------------

/// One link of a provenance chain: the stage that produced a task and the
/// numeric id it was assigned there.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProvenanceEntry {
    pub worker: String,
    pub id: u64,
}

impl ProvenanceEntry {
    pub fn new(worker: impl Into<String>, id: u64) -> Self {
        Self {
            worker: worker.into(),
            id,
        }
    }
}

impl std::fmt::Display for ProvenanceEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.worker, self.id)
    }
}

/// Ordered ancestry of a task, root first.
///
/// Chains compare and hash by value, so two tasks that share a leading
/// subsequence share the corresponding prefix key in the tracker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProvenanceChain(Vec<ProvenanceEntry>);

impl ProvenanceChain {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn from_entries(entries: Vec<ProvenanceEntry>) -> Self {
        Self(entries)
    }

    pub fn entries(&self) -> &[ProvenanceEntry] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append a link in place.
    pub fn push(&mut self, worker: impl Into<String>, id: u64) {
        self.0.push(ProvenanceEntry::new(worker, id));
    }

    /// A copy of this chain with one more link appended.
    pub fn extended(&self, worker: impl Into<String>, id: u64) -> Self {
        let mut chain = self.clone();
        chain.push(worker, id);
        chain
    }

    /// The leading `len` links, or `None` if the chain is shorter or `len` is 0.
    pub fn prefix(&self, len: usize) -> Option<Self> {
        if len == 0 || len > self.0.len() {
            return None;
        }
        Some(Self(self.0[..len].to_vec()))
    }

    /// Every non-empty leading subsequence, shortest first.
    pub fn prefixes(&self) -> impl Iterator<Item = ProvenanceChain> + '_ {
        (1..=self.0.len()).map(|len| Self(self.0[..len].to_vec()))
    }

    pub fn starts_with(&self, prefix: &ProvenanceChain) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// `"{worker}_{id}"` for every link, as shown on the dashboard.
    pub fn labels(&self) -> Vec<String> {
        self.0.iter().map(ToString::to_string).collect()
    }
}

impl std::fmt::Display for ProvenanceChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.labels().join("/"))
    }
}

impl From<Vec<(&str, u64)>> for ProvenanceChain {
    fn from(links: Vec<(&str, u64)>) -> Self {
        Self(
            links
                .into_iter()
                .map(|(worker, id)| ProvenanceEntry::new(worker, id))
                .collect(),
        )
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A unit of work handed to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Task type, e.g. "chunk" or "summary". Shown as `type` in snapshots.
    pub name: String,

    /// Arbitrary payload. The dispatcher doesn't interpret it.
    pub data: serde_json::Value,

    provenance: ProvenanceChain,

    /// Ancestor tasks, root first. Each ancestor is stored without its own
    /// input provenance.
    input_provenance: Vec<Task>,

    retry_count: u32,
}

impl Task {
    /// A root task with no provenance yet. Give it an origin with
    /// [`Task::with_origin`] before handing it to the dispatcher.
    pub fn new(name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            data,
            provenance: ProvenanceChain::new(),
            input_provenance: Vec::new(),
            retry_count: 0,
        }
    }

    /// Append an origin link, used when seeding tasks from outside the graph.
    pub fn with_origin(mut self, worker: impl Into<String>, id: u64) -> Self {
        self.provenance.push(worker, id);
        self
    }

    /// Build a child of `parent` produced by stage `worker` under `id`.
    pub fn derive_from(
        parent: &Task,
        worker: impl Into<String>,
        id: u64,
        name: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        let mut input_provenance = parent.input_provenance.clone();
        input_provenance.push(parent.without_inputs());

        Self {
            name: name.into(),
            data,
            provenance: parent.provenance.extended(worker, id),
            input_provenance,
            retry_count: 0,
        }
    }

    pub fn provenance(&self) -> &ProvenanceChain {
        &self.provenance
    }

    pub fn input_provenance(&self) -> &[Task] {
        &self.input_provenance
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub(crate) fn increment_retry(&mut self) {
        self.retry_count += 1;
    }

    /// Shorthand for `self.provenance().prefix(len)`.
    pub fn prefix(&self, len: usize) -> Option<ProvenanceChain> {
        self.provenance.prefix(len)
    }

    /// The most recent ancestor with the given task type.
    pub fn find_input_task(&self, name: &str) -> Option<&Task> {
        self.input_provenance.iter().rev().find(|t| t.name == name)
    }

    /// `{"type": ..., "data": ...}`, the shape used for input provenance in
    /// snapshots.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "type": self.name,
            "data": self.data,
        })
    }

    fn without_inputs(&self) -> Task {
        Task {
            name: self.name.clone(),
            data: self.data.clone(),
            provenance: self.provenance.clone(),
            input_provenance: Vec::new(),
            retry_count: self.retry_count,
        }
    }
}
