//! Point-in-time views consumed by the debug dashboard.

use serde::{Deserialize, Serialize};

use super::history::{FailedRecord, TaskRecord, WorkSubject};

/// One row of a queued/active/completed/failed listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: u64,
    #[serde(rename = "type")]
    pub task_type: String,
    pub worker: String,
    /// `"{worker}_{id}"` per link, root first.
    pub provenance: Vec<String>,
    pub input_provenance: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskInfo {
    pub(crate) fn new(id: u64, worker: &str, subject: &WorkSubject) -> Self {
        let input_provenance = subject
            .task()
            .map(|task| task.input_provenance().iter().map(|t| t.to_json()).collect())
            .unwrap_or_default();

        Self {
            id,
            task_type: subject.type_name().to_string(),
            worker: worker.to_string(),
            provenance: subject.provenance().labels(),
            input_provenance,
            error: None,
        }
    }
}

impl From<&TaskRecord> for TaskInfo {
    fn from(record: &TaskRecord) -> Self {
        TaskInfo::new(
            record.id,
            &record.worker,
            &WorkSubject::Task(record.task.clone()),
        )
    }
}

impl From<&FailedRecord> for TaskInfo {
    fn from(record: &FailedRecord) -> Self {
        TaskInfo {
            error: Some(record.error.clone()),
            ..TaskInfo::new(record.id, &record.worker, &record.subject)
        }
    }
}

/// Aggregate counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherStats {
    /// Queued tasks, matching `get_queued_tasks`. Pending notifications are
    /// not counted.
    pub queued: usize,
    pub active: usize,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_retried: u64,
    /// Provenance prefixes with a non-zero count.
    pub tracked_prefixes: usize,
    /// Prefixes with at least one watcher.
    pub watched_prefixes: usize,
}
