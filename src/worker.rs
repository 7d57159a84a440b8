//! Worker interface.
//!
//! A worker is a named processing stage. The dispatcher only needs its
//! identity, its retry policy, and the two hooks below; everything else about
//! a worker (what it computes, where it sends results) is its own business.

use std::sync::Arc;

use crate::engine::Dispatcher;
use crate::error::Result;
use crate::model::{ProvenanceChain, Task};

/// A processing stage driven by the dispatcher.
///
/// Hooks run on the dispatcher's blocking pool. Returning `Err` or panicking
/// sends the call down the failure path.
pub trait Worker: Send + Sync {
    /// Stable identifier. Watch registrations are keyed by it.
    fn name(&self) -> &str;

    /// How many times a failed task is re-queued before it is recorded as failed.
    fn num_retries(&self) -> u32 {
        0
    }

    /// Process one task. May publish further work through `ctx`.
    fn pre_consume_work(&self, task: &Task, ctx: &WorkContext<'_>) -> anyhow::Result<()>;

    /// Called once each time a watched prefix is released.
    fn notify(&self, prefix: &ProvenanceChain, ctx: &WorkContext<'_>) -> anyhow::Result<()> {
        let _ = (prefix, ctx);
        Ok(())
    }
}

/// Handle passed to worker hooks.
///
/// Wraps the dispatcher together with the running worker and, for
/// `pre_consume_work`, the task being consumed.
pub struct WorkContext<'a> {
    dispatcher: &'a Dispatcher,
    worker: &'a Arc<dyn Worker>,
    task: Option<&'a Task>,
}

impl<'a> WorkContext<'a> {
    pub(crate) fn new(
        dispatcher: &'a Dispatcher,
        worker: &'a Arc<dyn Worker>,
        task: Option<&'a Task>,
    ) -> Self {
        Self {
            dispatcher,
            worker,
            task,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        self.dispatcher
    }

    pub fn worker_name(&self) -> &str {
        self.worker.name()
    }

    /// The task being consumed. `None` inside `notify`.
    pub fn task(&self) -> Option<&Task> {
        self.task
    }

    pub fn add_work(&self, consumer: Arc<dyn Worker>, task: Task) -> Result<()> {
        self.dispatcher.add_work(consumer, task)
    }

    pub fn add_multiple_work(&self, items: Vec<(Arc<dyn Worker>, Task)>) -> Result<()> {
        self.dispatcher.add_multiple_work(items)
    }

    /// A new task produced by the running worker.
    ///
    /// Inside `pre_consume_work` the task descends from the consumed one.
    /// Inside `notify` it starts a fresh chain rooted at this worker.
    pub fn derive(&self, name: impl Into<String>, data: serde_json::Value) -> Task {
        let id = self.dispatcher.next_provenance_id();
        match self.task {
            Some(parent) => Task::derive_from(parent, self.worker.name(), id, name, data),
            None => Task::new(name, data).with_origin(self.worker.name(), id),
        }
    }

    /// [`derive`](Self::derive) a task and hand it to `consumer`.
    pub fn publish(
        &self,
        consumer: Arc<dyn Worker>,
        name: impl Into<String>,
        data: serde_json::Value,
    ) -> Result<()> {
        let task = self.derive(name, data);
        self.dispatcher.add_work(consumer, task)
    }

    /// Watch `prefix` on behalf of the running worker.
    pub fn watch(&self, prefix: ProvenanceChain) -> bool {
        self.dispatcher
            .watch(prefix, Arc::clone(self.worker), self.task)
    }

    pub fn unwatch(&self, prefix: &ProvenanceChain) -> bool {
        self.dispatcher.unwatch(prefix, self.worker.name())
    }
}
