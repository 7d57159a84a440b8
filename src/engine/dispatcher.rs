//! The dispatcher: work queue, scheduler loop, and completion pipeline.
//!
//! Producers call [`Dispatcher::add_work`]; provenance is counted before the
//! task becomes visible in the queue. [`Dispatcher::dispatch`] pops items and
//! hands them to a bounded blocking pool. When a task reaches a terminal
//! state its provenance references are dropped, and every prefix released by
//! that drop schedules a `notify` call for each of its watchers.

use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::history::{FailedRecord, History, TaskRecord, WorkSubject};
use super::provenance::ProvenanceTracker;
use super::snapshot::{DispatcherStats, TaskInfo};
use super::watch::WatchRegistry;
use crate::config::DispatcherConfig;
use crate::error::{Error, Result};
use crate::event::{Event, EventKind, EventLog};
use crate::model::{ProvenanceChain, Task};
use crate::telemetry::metrics::{self, worker_labels};
use crate::telemetry::task::{record_state_transition, start_task_span};
use crate::worker::{WorkContext, Worker};

/// A queued unit of work. The id labels it in snapshots and events.
struct Work {
    id: u64,
    worker: Arc<dyn Worker>,
    subject: WorkSubject,
}

struct ActiveEntry {
    worker: String,
    subject: WorkSubject,
}

struct Ledger {
    completed: History<TaskRecord>,
    failed: History<FailedRecord>,
    total_completed: u64,
    total_failed: u64,
    total_retried: u64,
}

struct Inner {
    config: DispatcherConfig,
    provenance: ProvenanceTracker,
    watches: WatchRegistry,
    queue: Mutex<VecDeque<Work>>,
    queue_ready: Notify,
    /// Items popped from the queue and not yet finished. Incremented under
    /// the queue lock so that "queue empty and nothing active" is never
    /// observed while an item is in hand.
    active: AtomicUsize,
    active_tasks: Mutex<BTreeMap<u64, ActiveEntry>>,
    ledger: Mutex<Ledger>,
    events: Mutex<EventLog>,
    pool: Arc<Semaphore>,
    idle: Notify,
    stopped: AtomicBool,
    quit: AtomicBool,
    quit_requested: Notify,
    next_task_id: AtomicU64,
    next_provenance_id: AtomicU64,
}

/// Schedules tasks onto a bounded pool and tracks their provenance.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DispatcherConfig::default())
    }
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        let pool = Arc::new(Semaphore::new(config.max_parallel.max(1)));
        let ledger = Ledger {
            completed: History::new(config.history_capacity),
            failed: History::new(config.history_capacity),
            total_completed: 0,
            total_failed: 0,
            total_retried: 0,
        };
        let events = EventLog::new(config.event_capacity);

        Self {
            inner: Arc::new(Inner {
                config,
                provenance: ProvenanceTracker::new(),
                watches: WatchRegistry::new(),
                queue: Mutex::new(VecDeque::new()),
                queue_ready: Notify::new(),
                active: AtomicUsize::new(0),
                active_tasks: Mutex::new(BTreeMap::new()),
                ledger: Mutex::new(ledger),
                events: Mutex::new(events),
                pool,
                idle: Notify::new(),
                stopped: AtomicBool::new(false),
                quit: AtomicBool::new(false),
                quit_requested: Notify::new(),
                next_task_id: AtomicU64::new(0),
                next_provenance_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    pub fn provenance(&self) -> &ProvenanceTracker {
        &self.inner.provenance
    }

    pub fn watches(&self) -> &WatchRegistry {
        &self.inner.watches
    }

    /// Fresh id for a provenance link. Monotonic across the dispatcher.
    pub fn next_provenance_id(&self) -> u64 {
        self.inner.next_provenance_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    // -----------------------------------------------------------------------
    // Producers
    // -----------------------------------------------------------------------

    /// Count `task`'s provenance, then queue it for `worker`.
    pub fn add_work(&self, worker: Arc<dyn Worker>, task: Task) -> Result<()> {
        ensure_provenance(&task)?;
        self.inner.provenance.add(task.provenance());
        self.enqueue(worker, WorkSubject::Task(task));
        Ok(())
    }

    /// Count the provenance of every item before any of them is queued, so a
    /// fast consumer can't release a shared prefix while its siblings are
    /// still being added.
    pub fn add_multiple_work(&self, items: Vec<(Arc<dyn Worker>, Task)>) -> Result<()> {
        for (_, task) in &items {
            ensure_provenance(task)?;
        }
        self.inner
            .provenance
            .add_all(items.iter().map(|(_, task)| task.provenance()));
        for (worker, task) in items {
            self.enqueue(worker, WorkSubject::Task(task));
        }
        Ok(())
    }

    fn enqueue(&self, worker: Arc<dyn Worker>, subject: WorkSubject) {
        let id = self.inner.next_task_id.fetch_add(1, Ordering::Relaxed) + 1;

        if let WorkSubject::Task(ref task) = subject {
            debug!(
                worker = worker.name(),
                task_id = id,
                provenance = %task.provenance(),
                retry_count = task.retry_count(),
                "task queued"
            );
            metrics::tasks_enqueued().add(1, &worker_labels(worker.name()));
            self.record(EventKind::TaskQueued {
                id,
                worker: worker.name().to_string(),
                provenance: task.provenance().clone(),
            });
        }

        self.inner.queue.lock().push_back(Work {
            id,
            worker,
            subject,
        });
        self.inner.queue_ready.notify_one();
    }

    // -----------------------------------------------------------------------
    // Watchers
    // -----------------------------------------------------------------------

    /// Register `worker` to be notified when `prefix` is released.
    ///
    /// Returns false if it was already registered. When `task` is given and
    /// `prefix` is not tracked at the time of the call, a notification is
    /// scheduled right away: the prefix was released before the watch
    /// existed and would otherwise never fire.
    pub fn watch(
        &self,
        prefix: ProvenanceChain,
        worker: Arc<dyn Worker>,
        task: Option<&Task>,
    ) -> bool {
        let added = self
            .inner
            .watches
            .watch(prefix.clone(), Arc::clone(&worker));

        if task.is_some() && !self.inner.provenance.is_tracked(&prefix) {
            debug!(
                worker = worker.name(),
                provenance = %prefix,
                "watched prefix already released, notifying now"
            );
            self.enqueue(worker, WorkSubject::Notify(prefix));
        }

        added
    }

    pub fn unwatch(&self, prefix: &ProvenanceChain, worker: &str) -> bool {
        self.inner.watches.unwatch(prefix, worker)
    }

    /// Schedule `notify(prefix)` for every worker watching `prefix`.
    pub fn notify_all(&self, prefix: &ProvenanceChain) {
        for watcher in self.inner.watches.watchers(prefix) {
            self.enqueue(watcher, WorkSubject::Notify(prefix.clone()));
        }
    }

    // -----------------------------------------------------------------------
    // Run loop
    // -----------------------------------------------------------------------

    /// Run the scheduler until [`stop`](Self::stop) is called and all queued
    /// and active work has drained.
    pub async fn dispatch(&self) {
        info!(
            max_parallel = self.inner.config.max_parallel,
            "dispatcher started"
        );

        loop {
            if self.is_stopped() && self.is_idle() {
                break;
            }

            // Hold a free slot before popping so an item is always visible
            // as either queued or active.
            let permit = match Arc::clone(&self.inner.pool).acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!("worker pool closed: {e}");
                    break;
                }
            };

            let Some(work) = self.pop() else {
                drop(permit);
                let _ = tokio::time::timeout(
                    self.inner.config.poll_interval(),
                    self.inner.queue_ready.notified(),
                )
                .await;
                continue;
            };

            self.submit(work, permit);
        }

        info!("dispatcher stopped");
    }

    /// Run [`dispatch`](Self::dispatch) on the current tokio runtime.
    pub fn spawn(&self) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.dispatch().await })
    }

    /// Ask the run loop to exit once all work has drained.
    pub fn stop(&self) {
        info!("dispatcher stop requested");
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.queue_ready.notify_one();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Mark the run as acknowledged by an operator, releasing
    /// `wait_for_completion(true)`.
    pub fn request_quit(&self) {
        self.inner.quit.store(true, Ordering::SeqCst);
        self.inner.quit_requested.notify_waiters();
    }

    /// Wait until nothing is queued or active. With `wait_for_quit`, keep
    /// waiting afterwards until [`request_quit`](Self::request_quit).
    pub async fn wait_for_completion(&self, wait_for_quit: bool) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                break;
            }
            notified.await;
        }

        if !wait_for_quit {
            return;
        }

        loop {
            let notified = self.inner.quit_requested.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.quit.load(Ordering::SeqCst) {
                break;
            }
            notified.await;
        }
    }

    /// True when the queue is empty and no work is running.
    pub fn is_idle(&self) -> bool {
        let queue = self.inner.queue.lock();
        queue.is_empty() && self.inner.active.load(Ordering::SeqCst) == 0
    }

    /// Take the front item and mark it active in one critical section.
    fn pop(&self) -> Option<Work> {
        let mut queue = self.inner.queue.lock();
        let work = queue.pop_front()?;
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        self.inner.active_tasks.lock().insert(
            work.id,
            ActiveEntry {
                worker: work.worker.name().to_string(),
                subject: work.subject.clone(),
            },
        );
        Some(work)
    }

    fn submit(&self, work: Work, permit: OwnedSemaphorePermit) {
        let dispatcher = self.clone();
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            dispatcher.execute(work);
        });
    }

    // -----------------------------------------------------------------------
    // Execution and completion
    // -----------------------------------------------------------------------

    fn execute(&self, work: Work) {
        let Work {
            id,
            worker,
            subject,
        } = work;
        let kind = match subject {
            WorkSubject::Task(_) => "task",
            WorkSubject::Notify(_) => "notify",
        };

        let span = start_task_span(worker.name(), id, kind);
        let _entered = span.enter();
        record_state_transition(&span, "queued", "active");

        self.record(EventKind::TaskStarted {
            id,
            worker: worker.name().to_string(),
        });

        let started = Instant::now();
        let outcome = {
            let ctx = WorkContext::new(self, &worker, subject.task());
            let result = catch_unwind(AssertUnwindSafe(|| match &subject {
                WorkSubject::Task(task) => worker.pre_consume_work(task, &ctx),
                WorkSubject::Notify(prefix) => worker.notify(prefix, &ctx),
            }));
            match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(format!("{e:#}")),
                Err(payload) => Err(panic_message(payload)),
            }
        };
        let elapsed = started.elapsed();
        metrics::task_duration_ms().record(
            elapsed.as_secs_f64() * 1000.0,
            &worker_labels(worker.name()),
        );

        self.inner.active_tasks.lock().remove(&id);

        let max_retries = match (&subject, &outcome) {
            (WorkSubject::Task(_), Err(_)) => retry_limit(worker.as_ref()),
            _ => 0,
        };
        let to = match (&subject, &outcome) {
            (_, Ok(())) => "completed",
            (WorkSubject::Task(task), Err(_)) if can_retry(max_retries, task) => "retrying",
            (_, Err(_)) => "failed",
        };
        record_state_transition(&span, "active", to);

        match subject {
            WorkSubject::Task(task) => {
                self.task_completed(id, worker, task, outcome, max_retries, elapsed)
            }
            WorkSubject::Notify(prefix) => self.notify_completed(id, worker, prefix, outcome),
        }
    }

    fn task_completed(
        &self,
        id: u64,
        worker: Arc<dyn Worker>,
        mut task: Task,
        outcome: std::result::Result<(), String>,
        max_retries: u32,
        elapsed: Duration,
    ) {
        let name = worker.name().to_string();
        let provenance = task.provenance().clone();

        match outcome {
            Ok(()) => {
                debug!(worker = %name, task_id = id, "task completed");
                {
                    let mut ledger = self.inner.ledger.lock();
                    ledger.completed.push(TaskRecord {
                        id,
                        worker: name.clone(),
                        task,
                        finished_at: Utc::now(),
                    });
                    ledger.total_completed += 1;
                }
                metrics::tasks_completed().add(1, &worker_labels(&name));
                self.record(EventKind::TaskCompleted {
                    id,
                    worker: name,
                    duration_ms: elapsed.as_millis() as u64,
                });
            }
            Err(error) if can_retry(max_retries, &task) => {
                task.increment_retry();
                warn!(
                    worker = %name,
                    task_id = id,
                    retry_count = task.retry_count(),
                    max_retries,
                    %error,
                    "task failed, retrying"
                );
                self.inner.ledger.lock().total_retried += 1;
                metrics::tasks_retried().add(1, &worker_labels(&name));
                self.record(EventKind::TaskRetried {
                    id,
                    worker: name,
                    retry_count: task.retry_count(),
                    error,
                });

                // Provenance is untouched: the chain is unchanged and still
                // holds its references. Queue before releasing the active
                // slot so waiters never see a false idle.
                self.enqueue(worker, WorkSubject::Task(task));
                self.finish();
                return;
            }
            Err(error) => {
                error!(
                    worker = %name,
                    task_id = id,
                    retry_count = task.retry_count(),
                    %error,
                    "task failed"
                );
                let retry_count = task.retry_count();
                {
                    let mut ledger = self.inner.ledger.lock();
                    ledger.failed.push(FailedRecord {
                        id,
                        worker: name.clone(),
                        subject: WorkSubject::Task(task),
                        error: error.clone(),
                        failed_at: Utc::now(),
                    });
                    ledger.total_failed += 1;
                }
                metrics::tasks_failed().add(1, &worker_labels(&name));
                self.record(EventKind::TaskFailed {
                    id,
                    worker: name,
                    retry_count,
                    error,
                });
            }
        }

        self.release(&provenance);
        self.finish();
    }

    fn notify_completed(
        &self,
        id: u64,
        worker: Arc<dyn Worker>,
        prefix: ProvenanceChain,
        outcome: std::result::Result<(), String>,
    ) {
        let name = worker.name().to_string();
        metrics::watch_notifications().add(1, &worker_labels(&name));

        match outcome {
            Ok(()) => {
                debug!(worker = %name, task_id = id, provenance = %prefix, "watcher notified");
                self.record(EventKind::WatcherNotified {
                    id,
                    worker: name,
                    prefix,
                });
            }
            Err(error) => {
                error!(
                    worker = %name,
                    task_id = id,
                    provenance = %prefix,
                    %error,
                    "notify failed"
                );
                {
                    let mut ledger = self.inner.ledger.lock();
                    ledger.failed.push(FailedRecord {
                        id,
                        worker: name.clone(),
                        subject: WorkSubject::Notify(prefix.clone()),
                        error: error.clone(),
                        failed_at: Utc::now(),
                    });
                    ledger.total_failed += 1;
                }
                metrics::tasks_failed().add(1, &worker_labels(&name));
                self.record(EventKind::NotifyFailed {
                    id,
                    worker: name,
                    prefix,
                    error,
                });
            }
        }

        self.finish();
    }

    /// Drop `chain`'s references and notify watchers of every released prefix.
    fn release(&self, chain: &ProvenanceChain) {
        for prefix in self.inner.provenance.remove(chain) {
            debug!(provenance = %prefix, "provenance released");
            let origin = prefix
                .entries()
                .last()
                .map(|entry| entry.worker.as_str())
                .unwrap_or_default();
            metrics::provenance_released().add(1, &worker_labels(origin));
            self.record(EventKind::ProvenanceReleased {
                prefix: prefix.clone(),
            });
            self.notify_all(&prefix);
        }
    }

    fn finish(&self) {
        self.inner.active.fetch_sub(1, Ordering::SeqCst);
        if self.is_idle() {
            self.inner.idle.notify_waiters();
            // Wake the run loop so a pending stop is noticed right away.
            self.inner.queue_ready.notify_one();
        }
    }

    fn record(&self, kind: EventKind) {
        self.inner.events.lock().record(kind);
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Tasks waiting in the queue, front first. Pending notifications are
    /// not listed.
    pub fn get_queued_tasks(&self) -> Vec<TaskInfo> {
        self.inner
            .queue
            .lock()
            .iter()
            .filter(|work| matches!(work.subject, WorkSubject::Task(_)))
            .map(|work| TaskInfo::new(work.id, work.worker.name(), &work.subject))
            .collect()
    }

    /// Tasks and notifications currently running, by id.
    pub fn get_active_tasks(&self) -> Vec<TaskInfo> {
        self.inner
            .active_tasks
            .lock()
            .iter()
            .map(|(id, entry)| TaskInfo::new(*id, &entry.worker, &entry.subject))
            .collect()
    }

    /// Most recent successful tasks, oldest first.
    pub fn get_completed_tasks(&self) -> Vec<TaskInfo> {
        self.inner
            .ledger
            .lock()
            .completed
            .iter()
            .map(TaskInfo::from)
            .collect()
    }

    /// Most recent terminal failures, oldest first.
    pub fn get_failed_tasks(&self) -> Vec<TaskInfo> {
        self.inner
            .ledger
            .lock()
            .failed
            .iter()
            .map(TaskInfo::from)
            .collect()
    }

    pub fn stats(&self) -> DispatcherStats {
        let queued = self
            .inner
            .queue
            .lock()
            .iter()
            .filter(|work| matches!(work.subject, WorkSubject::Task(_)))
            .count();
        let active = self.inner.active.load(Ordering::SeqCst);
        let tracked_prefixes = self.inner.provenance.len();
        let watched_prefixes = self.inner.watches.len();
        let ledger = self.inner.ledger.lock();
        DispatcherStats {
            queued,
            active,
            total_completed: ledger.total_completed,
            total_failed: ledger.total_failed,
            total_retried: ledger.total_retried,
            tracked_prefixes,
            watched_prefixes,
        }
    }

    /// Current reference count for `prefix`.
    pub fn provenance_count(&self, prefix: &ProvenanceChain) -> usize {
        self.inner.provenance.count(prefix)
    }

    /// Events with a sequence number greater than `seq`.
    pub fn events_since(&self, seq: u64) -> Vec<Event> {
        self.inner.events.lock().since(seq)
    }
}

fn ensure_provenance(task: &Task) -> Result<()> {
    if task.provenance().is_empty() {
        return Err(Error::EmptyProvenance {
            task: task.name.clone(),
        });
    }
    Ok(())
}

/// The worker's retry limit. A panicking `num_retries` counts as no retries.
fn retry_limit(worker: &dyn Worker) -> u32 {
    catch_unwind(AssertUnwindSafe(|| worker.num_retries())).unwrap_or_else(|payload| {
        warn!(
            error = %panic_message(payload),
            "num_retries panicked, treating failure as terminal"
        );
        0
    })
}

fn can_retry(max_retries: u32, task: &Task) -> bool {
    max_retries > 0 && task.retry_count() < max_retries
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("worker panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("worker panicked: {msg}")
    } else {
        "worker panicked".to_string()
    }
}
