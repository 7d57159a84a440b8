//! Bounded history of finished work, kept for the dashboard.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::model::{ProvenanceChain, Task};

/// Fixed-capacity ring buffer. Pushing into a full buffer evicts the oldest item.
#[derive(Debug, Clone)]
pub struct History<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> History<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity,
        }
    }

    /// Append `item`, returning the evicted oldest item if the buffer was full.
    pub fn push(&mut self, item: T) -> Option<T> {
        if self.capacity == 0 {
            return Some(item);
        }
        let evicted = if self.items.len() == self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    /// Oldest first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// What a unit of dispatched work operates on.
#[derive(Debug, Clone)]
pub enum WorkSubject {
    /// An ordinary task for `pre_consume_work`.
    Task(Task),
    /// A released prefix for `notify`.
    Notify(ProvenanceChain),
}

impl WorkSubject {
    /// Task type, or `"notify"` for notifications.
    pub fn type_name(&self) -> &str {
        match self {
            WorkSubject::Task(task) => &task.name,
            WorkSubject::Notify(_) => "notify",
        }
    }

    pub fn provenance(&self) -> &ProvenanceChain {
        match self {
            WorkSubject::Task(task) => task.provenance(),
            WorkSubject::Notify(prefix) => prefix,
        }
    }

    pub fn task(&self) -> Option<&Task> {
        match self {
            WorkSubject::Task(task) => Some(task),
            WorkSubject::Notify(_) => None,
        }
    }
}

/// A task that finished successfully.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: u64,
    pub worker: String,
    pub task: Task,
    pub finished_at: DateTime<Utc>,
}

/// A task whose retries ran out, or a notification that failed.
#[derive(Debug, Clone)]
pub struct FailedRecord {
    pub id: u64,
    pub worker: String,
    pub subject: WorkSubject,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}
