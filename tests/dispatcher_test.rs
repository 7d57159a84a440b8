//! Integration tests for the dispatcher: scheduling, retries, provenance
//! release, and join notifications.

use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use parking_lot::Mutex;
use planq::config::DispatcherConfig;
use planq::event::EventKind;
use planq::{Dispatcher, ProvenanceChain, Task, WorkContext, Worker};
use serde_json::json;
use tokio::time::{sleep, timeout};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn test_dispatcher(max_parallel: usize) -> Dispatcher {
    Dispatcher::new(DispatcherConfig {
        max_parallel,
        poll_interval_ms: 20,
        ..DispatcherConfig::default()
    })
}

async fn drain(dispatcher: &Dispatcher) {
    timeout(Duration::from_secs(10), dispatcher.wait_for_completion(false))
        .await
        .expect("dispatcher did not drain");
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(10), async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never became true");
}

fn root(worker: &str, id: u64) -> Task {
    Task::new("root", json!({ "id": id })).with_origin(worker, id)
}

#[derive(Clone, Copy, PartialEq)]
enum Mode {
    Succeed,
    AlwaysFail,
    FailFirstAttempt,
    Panic,
    FailNotify,
}

/// Records everything it sees and fails according to its mode.
struct Recorder {
    name: String,
    retries: u32,
    mode: Mode,
    consumed: Mutex<Vec<Task>>,
    notified: Mutex<Vec<ProvenanceChain>>,
}

impl Recorder {
    fn new(name: &str) -> Arc<Self> {
        Self::with_mode(name, Mode::Succeed, 0)
    }

    fn with_mode(name: &str, mode: Mode, retries: u32) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            retries,
            mode,
            consumed: Mutex::new(Vec::new()),
            notified: Mutex::new(Vec::new()),
        })
    }

    fn consumed(&self) -> Vec<Task> {
        self.consumed.lock().clone()
    }

    fn notified(&self) -> Vec<ProvenanceChain> {
        self.notified.lock().clone()
    }
}

impl Worker for Recorder {
    fn name(&self) -> &str {
        &self.name
    }

    fn num_retries(&self) -> u32 {
        self.retries
    }

    fn pre_consume_work(&self, task: &Task, _ctx: &WorkContext<'_>) -> anyhow::Result<()> {
        self.consumed.lock().push(task.clone());
        match self.mode {
            Mode::AlwaysFail => anyhow::bail!("boom"),
            Mode::FailFirstAttempt if task.retry_count() == 0 => anyhow::bail!("transient"),
            Mode::Panic => panic!("worker exploded"),
            _ => Ok(()),
        }
    }

    fn notify(&self, prefix: &ProvenanceChain, _ctx: &WorkContext<'_>) -> anyhow::Result<()> {
        self.notified.lock().push(prefix.clone());
        if self.mode == Mode::FailNotify {
            anyhow::bail!("notify broke");
        }
        Ok(())
    }
}

/// Publishes `children` derived tasks to `consumer` for every task it consumes.
struct Fanout {
    name: String,
    children: u64,
    consumer: Arc<dyn Worker>,
}

impl Worker for Fanout {
    fn name(&self) -> &str {
        &self.name
    }

    fn pre_consume_work(&self, _task: &Task, ctx: &WorkContext<'_>) -> anyhow::Result<()> {
        for n in 0..self.children {
            ctx.publish(Arc::clone(&self.consumer), "child", json!({ "n": n }))?;
        }
        Ok(())
    }
}

/// Blocks inside `pre_consume_work` until the test sends on the gate.
struct Gate {
    open: Mutex<mpsc::Receiver<()>>,
}

impl Worker for Gate {
    fn name(&self) -> &str {
        "gate"
    }

    fn pre_consume_work(&self, _task: &Task, _ctx: &WorkContext<'_>) -> anyhow::Result<()> {
        self.open.lock().recv()?;
        Ok(())
    }
}

/// Records how many tasks had completed at the moment it was notified.
struct JoinProbe {
    seen: Mutex<Vec<(ProvenanceChain, u64)>>,
}

impl Worker for JoinProbe {
    fn name(&self) -> &str {
        "join-probe"
    }

    fn pre_consume_work(&self, _task: &Task, _ctx: &WorkContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn notify(&self, prefix: &ProvenanceChain, ctx: &WorkContext<'_>) -> anyhow::Result<()> {
        let completed = ctx.dispatcher().stats().total_completed;
        self.seen.lock().push((prefix.clone(), completed));
        Ok(())
    }
}

/// Fans out `children` tasks and watches its own provenance. Once that
/// subtree is done, `notify` publishes a fresh task to `sink`.
struct Joiner {
    children: u64,
    consumer: Arc<dyn Worker>,
    sink: Arc<dyn Worker>,
    joins: Mutex<Vec<ProvenanceChain>>,
}

impl Worker for Joiner {
    fn name(&self) -> &str {
        "joiner"
    }

    fn pre_consume_work(&self, task: &Task, ctx: &WorkContext<'_>) -> anyhow::Result<()> {
        for n in 0..self.children {
            ctx.publish(Arc::clone(&self.consumer), "child", json!({ "n": n }))?;
        }
        ctx.watch(task.provenance().clone());
        Ok(())
    }

    fn notify(&self, prefix: &ProvenanceChain, ctx: &WorkContext<'_>) -> anyhow::Result<()> {
        self.joins.lock().push(prefix.clone());
        ctx.publish(
            Arc::clone(&self.sink),
            "joined",
            json!({ "prefix": prefix.to_string() }),
        )?;
        ctx.unwatch(prefix);
        Ok(())
    }
}

/// Records each task with the completed total observed when it started.
struct Sink {
    seen: Mutex<Vec<(Task, u64)>>,
}

impl Worker for Sink {
    fn name(&self) -> &str {
        "sink"
    }

    fn pre_consume_work(&self, task: &Task, ctx: &WorkContext<'_>) -> anyhow::Result<()> {
        let completed = ctx.dispatcher().stats().total_completed;
        self.seen.lock().push((task.clone(), completed));
        Ok(())
    }
}

/// Always fails, and its retry limit panics.
struct BrokenLimit;

impl Worker for BrokenLimit {
    fn name(&self) -> &str {
        "broken-limit"
    }

    fn num_retries(&self) -> u32 {
        panic!("no limit configured")
    }

    fn pre_consume_work(&self, _task: &Task, _ctx: &WorkContext<'_>) -> anyhow::Result<()> {
        anyhow::bail!("task failed")
    }
}

// ---------------------------------------------------------------------------
// Basic lifecycle
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn single_task_completes_and_notifies_watcher_once() {
    let dispatcher = test_dispatcher(4);
    let a = Recorder::new("A");
    let b = Recorder::new("B");
    let prefix = ProvenanceChain::from(vec![("A", 1)]);

    dispatcher.add_work(a.clone(), root("A", 1)).unwrap();
    assert_eq!(dispatcher.provenance_count(&prefix), 1);
    assert!(dispatcher.watch(prefix.clone(), b.clone(), None));

    let handle = dispatcher.spawn();
    drain(&dispatcher).await;

    assert_eq!(b.notified(), vec![prefix.clone()]);

    let completed = dispatcher.get_completed_tasks();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].worker, "A");
    assert_eq!(completed[0].provenance, vec!["A_1".to_string()]);
    assert!(dispatcher.get_failed_tasks().is_empty());
    assert!(dispatcher.provenance().is_empty());

    dispatcher.stop();
    timeout(Duration::from_secs(5), handle)
        .await
        .expect("dispatch loop did not exit")
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn wait_for_completion_returns_immediately_when_nothing_was_added() {
    let dispatcher = test_dispatcher(1);
    drain(&dispatcher).await;
    assert!(dispatcher.is_idle());
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_drains_queued_work_before_exiting() {
    let dispatcher = test_dispatcher(2);
    let worker = Recorder::new("w");

    for id in 1..=10 {
        dispatcher.add_work(worker.clone(), root("w", id)).unwrap();
    }
    dispatcher.stop();

    let handle = dispatcher.spawn();
    timeout(Duration::from_secs(10), handle)
        .await
        .expect("dispatch loop did not exit")
        .unwrap();

    assert_eq!(worker.consumed().len(), 10);
    assert_eq!(dispatcher.stats().total_completed, 10);
    assert!(dispatcher.is_idle());
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_provenance_is_rejected() {
    let dispatcher = test_dispatcher(1);
    let worker = Recorder::new("w");

    let result = dispatcher.add_work(worker.clone(), Task::new("orphan", json!(null)));
    assert!(matches!(
        result,
        Err(planq::error::Error::EmptyProvenance { .. })
    ));

    let shared: Arc<dyn Worker> = worker.clone();
    let batch = vec![
        (Arc::clone(&shared), root("w", 1)),
        (shared, Task::new("orphan", json!(null))),
    ];
    assert!(dispatcher.add_multiple_work(batch).is_err());

    // Rejected as a whole: nothing counted, nothing queued.
    assert!(dispatcher.provenance().is_empty());
    assert!(dispatcher.get_queued_tasks().is_empty());
}

// ---------------------------------------------------------------------------
// Provenance and joins
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn provenance_is_released_after_all_descendants_finish() {
    let dispatcher = test_dispatcher(4);
    let leaf = Recorder::new("leaf");
    let middle: Arc<dyn Worker> = Arc::new(Fanout {
        name: "middle".to_string(),
        children: 2,
        consumer: leaf.clone(),
    });
    let top: Arc<dyn Worker> = Arc::new(Fanout {
        name: "top".to_string(),
        children: 3,
        consumer: middle,
    });

    dispatcher.add_work(top, root("seed", 1)).unwrap();
    let handle = dispatcher.spawn();
    drain(&dispatcher).await;

    assert_eq!(leaf.consumed().len(), 6);
    for task in leaf.consumed() {
        assert_eq!(task.provenance().len(), 3);
        assert_eq!(task.provenance().entries()[0].worker, "seed");
        assert_eq!(task.input_provenance().len(), 2);
    }
    assert!(dispatcher.provenance().is_empty());
    assert_eq!(dispatcher.stats().total_completed, 1 + 3 + 6);

    dispatcher.stop();
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn watcher_does_not_fire_while_prefix_is_held() {
    let dispatcher = test_dispatcher(2);
    let (open, gate_rx) = mpsc::channel();
    let gate: Arc<dyn Worker> = Arc::new(Gate {
        open: Mutex::new(gate_rx),
    });
    let watcher = Recorder::new("watcher");
    let prefix = ProvenanceChain::from(vec![("seed", 7)]);

    assert!(dispatcher.watch(prefix.clone(), watcher.clone(), None));
    dispatcher.add_work(gate, root("seed", 7)).unwrap();
    let handle = dispatcher.spawn();

    wait_until(|| dispatcher.get_active_tasks().len() == 1).await;
    let active = dispatcher.get_active_tasks();
    assert_eq!(active[0].worker, "gate");
    assert_eq!(active[0].provenance, vec!["seed_7".to_string()]);

    sleep(Duration::from_millis(50)).await;
    assert!(watcher.notified().is_empty());
    assert_eq!(dispatcher.provenance_count(&prefix), 1);

    open.send(()).unwrap();
    drain(&dispatcher).await;

    assert_eq!(watcher.notified(), vec![prefix]);
    assert!(dispatcher.get_active_tasks().is_empty());

    dispatcher.stop();
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn late_watch_with_task_notifies_immediately() {
    let dispatcher = test_dispatcher(2);
    let worker = Recorder::new("w");
    let late = Recorder::new("late");
    let task = root("seed", 3);
    let prefix = task.provenance().clone();

    let handle = dispatcher.spawn();
    dispatcher.add_work(worker.clone(), task.clone()).unwrap();
    drain(&dispatcher).await;
    assert!(dispatcher.provenance().is_empty());

    // Without a task argument nothing fires.
    let silent = Recorder::new("silent");
    assert!(dispatcher.watch(prefix.clone(), silent.clone(), None));

    assert!(dispatcher.watch(prefix.clone(), late.clone(), Some(&task)));
    drain(&dispatcher).await;

    assert_eq!(late.notified(), vec![prefix]);
    assert!(silent.notified().is_empty());

    dispatcher.stop();
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn batch_join_fires_once_after_every_task_and_descendant() {
    for round in 0..20 {
        let dispatcher = test_dispatcher(4);
        let leaf = Recorder::new("leaf");
        let stage: Arc<dyn Worker> = Arc::new(Fanout {
            name: "stage".to_string(),
            children: 1,
            consumer: leaf.clone(),
        });
        let probe = Arc::new(JoinProbe {
            seen: Mutex::new(Vec::new()),
        });
        let prefix = ProvenanceChain::from(vec![("batch", round)]);

        assert!(dispatcher.watch(prefix.clone(), probe.clone(), None));

        let batch: Vec<(Arc<dyn Worker>, Task)> = (1..=3)
            .map(|i| {
                let task = Task::new("item", json!({ "i": i }))
                    .with_origin("batch", round)
                    .with_origin("split", i);
                (Arc::clone(&stage), task)
            })
            .collect();
        dispatcher.add_multiple_work(batch).unwrap();
        assert_eq!(dispatcher.provenance_count(&prefix), 3);

        let handle = dispatcher.spawn();
        drain(&dispatcher).await;

        let seen = probe.seen.lock().clone();
        assert_eq!(seen.len(), 1, "round {round}: watcher fired {} times", seen.len());
        assert_eq!(seen[0].0, prefix);
        // 3 stage tasks plus the 3 leaves they spawned.
        assert_eq!(seen[0].1, 6, "round {round}: watcher fired early");
        assert!(dispatcher.provenance().is_empty());

        dispatcher.stop();
        handle.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn watch_is_idempotent_per_worker() {
    let dispatcher = test_dispatcher(1);
    let w = Recorder::new("w");
    let prefix = ProvenanceChain::from(vec![("seed", 1)]);

    assert!(dispatcher.watch(prefix.clone(), w.clone(), None));
    assert!(!dispatcher.watch(prefix.clone(), w.clone(), None));
    assert!(dispatcher.unwatch(&prefix, "w"));
    assert!(!dispatcher.unwatch(&prefix, "w"));
    assert!(dispatcher.watch(prefix.clone(), w.clone(), None));
}

#[tokio::test(flavor = "multi_thread")]
async fn every_released_prefix_notifies_its_watchers() {
    let dispatcher = test_dispatcher(2);
    let worker = Recorder::new("w");
    let outer = Recorder::new("outer");
    let inner = Recorder::new("inner");
    let task = Task::new("nested", json!(null))
        .with_origin("a", 1)
        .with_origin("b", 2);

    dispatcher.watch(task.prefix(1).unwrap(), outer.clone(), None);
    dispatcher.watch(task.prefix(2).unwrap(), inner.clone(), None);
    dispatcher.add_work(worker.clone(), task.clone()).unwrap();

    let handle = dispatcher.spawn();
    drain(&dispatcher).await;

    assert_eq!(outer.notified(), vec![task.prefix(1).unwrap()]);
    assert_eq!(inner.notified(), vec![task.prefix(2).unwrap()]);

    dispatcher.stop();
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn notify_publishes_new_work_after_watching_own_subtree() {
    let dispatcher = test_dispatcher(4);
    let kid = Recorder::new("kid");
    let sink = Arc::new(Sink {
        seen: Mutex::new(Vec::new()),
    });
    let joiner = Arc::new(Joiner {
        children: 3,
        consumer: kid.clone(),
        sink: sink.clone(),
        joins: Mutex::new(Vec::new()),
    });

    dispatcher.add_work(joiner.clone(), root("seed", 1)).unwrap();
    let handle = dispatcher.spawn();
    drain(&dispatcher).await;

    let kids: Vec<String> = kid
        .consumed()
        .iter()
        .map(|t| t.provenance().to_string())
        .collect();
    assert_eq!(kids.len(), 3);
    for label in &kids {
        assert!(label.starts_with("seed_1/joiner_"), "unexpected chain {label}");
    }

    assert_eq!(
        joiner.joins.lock().clone(),
        vec![ProvenanceChain::from(vec![("seed", 1)])]
    );

    // The sink task was covered by the drain, ran once, started after the
    // seed and all three children, and roots a fresh chain at the joiner.
    let seen = sink.seen.lock().clone();
    assert_eq!(seen.len(), 1);
    let (sink_task, completed_before) = &seen[0];
    assert_eq!(*completed_before, 4);
    assert_eq!(sink_task.provenance().labels(), vec!["joiner_4"]);
    assert!(sink_task.input_provenance().is_empty());

    let stats = dispatcher.stats();
    assert_eq!(stats.total_completed, 5);
    assert_eq!(stats.tracked_prefixes, 0);
    assert_eq!(stats.watched_prefixes, 0);
    assert!(dispatcher.provenance().is_empty());

    dispatcher.stop();
    handle.await.unwrap();
}

// ---------------------------------------------------------------------------
// Failure and retry
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn retries_are_bounded_by_worker_limit() {
    let dispatcher = test_dispatcher(2);
    let worker = Recorder::with_mode("flaky", Mode::AlwaysFail, 3);
    let watcher = Recorder::new("watcher");
    let task = root("seed", 1);

    dispatcher.watch(task.provenance().clone(), watcher.clone(), None);
    dispatcher.add_work(worker.clone(), task).unwrap();
    let handle = dispatcher.spawn();
    drain(&dispatcher).await;

    let attempts = worker.consumed();
    assert_eq!(attempts.len(), 4);
    let counts: Vec<u32> = attempts.iter().map(Task::retry_count).collect();
    assert_eq!(counts, vec![0, 1, 2, 3]);

    let failed = dispatcher.get_failed_tasks();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].worker, "flaky");
    assert_eq!(failed[0].error.as_deref(), Some("boom"));

    let stats = dispatcher.stats();
    assert_eq!(stats.total_retried, 3);
    assert_eq!(stats.total_failed, 1);
    assert_eq!(stats.total_completed, 0);

    // Terminal failure still releases provenance, and the join fires.
    assert!(dispatcher.provenance().is_empty());
    assert_eq!(watcher.notified().len(), 1);

    dispatcher.stop();
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn failure_without_retries_is_terminal() {
    let dispatcher = test_dispatcher(1);
    let worker = Recorder::with_mode("fragile", Mode::AlwaysFail, 0);

    dispatcher.add_work(worker.clone(), root("seed", 1)).unwrap();
    let handle = dispatcher.spawn();
    drain(&dispatcher).await;

    assert_eq!(worker.consumed().len(), 1);
    assert_eq!(dispatcher.get_failed_tasks().len(), 1);
    assert_eq!(dispatcher.stats().total_retried, 0);

    dispatcher.stop();
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_goes_to_back_of_queue() {
    let dispatcher = test_dispatcher(1);
    let worker = Recorder::with_mode("w", Mode::FailFirstAttempt, 1);

    let first = Task::new("first", json!(null)).with_origin("seed", 1);
    let second = Task::new("second", json!(null)).with_origin("seed", 2);
    let shared: Arc<dyn Worker> = worker.clone();
    let batch = vec![(Arc::clone(&shared), first), (shared, second)];
    dispatcher.add_multiple_work(batch).unwrap();

    let handle = dispatcher.spawn();
    drain(&dispatcher).await;

    let order: Vec<(String, u32)> = worker
        .consumed()
        .iter()
        .map(|t| (t.name.clone(), t.retry_count()))
        .collect();
    assert_eq!(
        order,
        vec![
            ("first".to_string(), 0),
            ("second".to_string(), 0),
            ("first".to_string(), 1),
            ("second".to_string(), 1),
        ]
    );
    assert_eq!(dispatcher.stats().total_completed, 2);

    dispatcher.stop();
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn panicking_worker_is_treated_as_failure() {
    let dispatcher = test_dispatcher(1);
    let worker = Recorder::with_mode("panicky", Mode::Panic, 1);

    dispatcher.add_work(worker.clone(), root("seed", 1)).unwrap();
    let handle = dispatcher.spawn();
    drain(&dispatcher).await;

    assert_eq!(worker.consumed().len(), 2);
    let failed = dispatcher.get_failed_tasks();
    assert_eq!(failed.len(), 1);
    let error = failed[0].error.clone().unwrap_or_default();
    assert!(error.contains("worker exploded"), "unexpected error: {error}");
    assert!(dispatcher.provenance().is_empty());

    dispatcher.stop();
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn notify_failure_is_recorded_and_not_retried() {
    let dispatcher = test_dispatcher(1);
    let worker = Recorder::new("w");
    let watcher = Recorder::with_mode("bad-watcher", Mode::FailNotify, 5);
    let task = root("seed", 9);

    dispatcher.watch(task.provenance().clone(), watcher.clone(), None);
    dispatcher.add_work(worker.clone(), task).unwrap();
    let handle = dispatcher.spawn();
    drain(&dispatcher).await;

    assert_eq!(watcher.notified().len(), 1);

    let failed = dispatcher.get_failed_tasks();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].task_type, "notify");
    assert_eq!(failed[0].worker, "bad-watcher");
    assert_eq!(failed[0].provenance, vec!["seed_9".to_string()]);
    assert_eq!(failed[0].error.as_deref(), Some("notify broke"));

    let stats = dispatcher.stats();
    assert_eq!(stats.total_failed, 1);
    assert_eq!(stats.total_retried, 0);
    assert_eq!(stats.total_completed, 1);

    dispatcher.stop();
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn panicking_retry_limit_makes_failure_terminal() {
    let dispatcher = test_dispatcher(1);

    dispatcher
        .add_work(Arc::new(BrokenLimit), root("seed", 1))
        .unwrap();
    let handle = dispatcher.spawn();
    drain(&dispatcher).await;

    let failed = dispatcher.get_failed_tasks();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].worker, "broken-limit");
    assert_eq!(failed[0].error.as_deref(), Some("task failed"));
    assert_eq!(dispatcher.stats().total_retried, 0);
    assert!(dispatcher.provenance().is_empty());

    dispatcher.stop();
    handle.await.unwrap();
}

// ---------------------------------------------------------------------------
// Introspection
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn queued_snapshot_lists_tasks_in_order() {
    let dispatcher = test_dispatcher(1);
    let worker = Recorder::new("w");

    dispatcher.add_work(worker.clone(), root("seed", 1)).unwrap();
    dispatcher.add_work(worker.clone(), root("seed", 2)).unwrap();

    let queued = dispatcher.get_queued_tasks();
    assert_eq!(queued.len(), 2);
    assert_eq!(queued[0].id, 1);
    assert_eq!(queued[1].id, 2);
    assert_eq!(queued[0].task_type, "root");
    assert_eq!(queued[1].provenance, vec!["seed_2".to_string()]);

    let value = serde_json::to_value(&queued[0]).unwrap();
    assert_eq!(value["type"], "root");
    assert_eq!(value["worker"], "w");
    assert!(value.get("error").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn completed_snapshot_carries_input_provenance() {
    let dispatcher = test_dispatcher(2);
    let leaf = Recorder::new("leaf");
    let parent: Arc<dyn Worker> = Arc::new(Fanout {
        name: "parent".to_string(),
        children: 1,
        consumer: leaf.clone(),
    });

    dispatcher
        .add_work(parent, Task::new("doc", json!({ "title": "x" })).with_origin("seed", 1))
        .unwrap();
    let handle = dispatcher.spawn();
    drain(&dispatcher).await;

    let completed = dispatcher.get_completed_tasks();
    let child = completed
        .iter()
        .find(|info| info.worker == "leaf")
        .expect("leaf task recorded");
    assert_eq!(child.task_type, "child");
    assert_eq!(
        child.provenance,
        vec!["seed_1".to_string(), "parent_1".to_string()]
    );
    assert_eq!(
        child.input_provenance,
        vec![json!({ "type": "doc", "data": { "title": "x" } })]
    );

    dispatcher.stop();
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn completed_history_is_bounded() {
    let dispatcher = Dispatcher::new(DispatcherConfig {
        max_parallel: 2,
        poll_interval_ms: 20,
        history_capacity: 3,
        ..DispatcherConfig::default()
    });
    let worker = Recorder::new("w");

    for id in 1..=5 {
        dispatcher.add_work(worker.clone(), root("seed", id)).unwrap();
    }
    let handle = dispatcher.spawn();
    drain(&dispatcher).await;

    assert_eq!(dispatcher.get_completed_tasks().len(), 3);
    assert_eq!(dispatcher.stats().total_completed, 5);

    dispatcher.stop();
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn events_are_sequenced_and_cover_the_lifecycle() {
    let dispatcher = test_dispatcher(1);
    let worker = Recorder::new("w");
    let watcher = Recorder::new("watcher");
    let task = root("seed", 1);

    dispatcher.watch(task.provenance().clone(), watcher.clone(), None);
    dispatcher.add_work(worker.clone(), task).unwrap();
    let handle = dispatcher.spawn();
    drain(&dispatcher).await;

    let events = dispatcher.events_since(0);
    for window in events.windows(2) {
        assert!(window[1].seq > window[0].seq);
    }

    let kinds: Vec<&EventKind> = events.iter().map(|e| &e.kind).collect();
    assert!(matches!(kinds[0], EventKind::TaskQueued { id: 1, .. }));
    assert!(kinds
        .iter()
        .any(|k| matches!(k, EventKind::TaskCompleted { id: 1, .. })));
    assert!(kinds
        .iter()
        .any(|k| matches!(k, EventKind::ProvenanceReleased { .. })));
    assert!(kinds
        .iter()
        .any(|k| matches!(k, EventKind::WatcherNotified { .. })));

    let last = events.last().map(|e| e.seq).unwrap_or_default();
    assert!(dispatcher.events_since(last).is_empty());

    dispatcher.stop();
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn wait_for_quit_blocks_until_requested() {
    let dispatcher = test_dispatcher(1);

    let early = timeout(
        Duration::from_millis(100),
        dispatcher.wait_for_completion(true),
    )
    .await;
    assert!(early.is_err(), "returned before quit was requested");

    dispatcher.request_quit();
    timeout(Duration::from_secs(5), dispatcher.wait_for_completion(true))
        .await
        .expect("quit request was not observed");
}

#[tokio::test(flavor = "multi_thread")]
async fn full_pool_leaves_waiting_items_in_the_queue() {
    let dispatcher = test_dispatcher(1);
    let (open, gate_rx) = mpsc::channel();
    let gate: Arc<dyn Worker> = Arc::new(Gate {
        open: Mutex::new(gate_rx),
    });

    for id in 1..=3 {
        dispatcher.add_work(Arc::clone(&gate), root("seed", id)).unwrap();
    }
    let handle = dispatcher.spawn();
    wait_until(|| dispatcher.get_active_tasks().len() == 1).await;

    // A pending notification sits in the queue but is not listed as a task.
    let watcher = Recorder::new("late");
    let released = root("gone", 7);
    dispatcher.watch(released.provenance().clone(), watcher.clone(), Some(&released));

    let active = dispatcher.get_active_tasks();
    assert_eq!(active[0].id, 1);
    let queued: Vec<u64> = dispatcher.get_queued_tasks().iter().map(|t| t.id).collect();
    assert_eq!(queued, vec![2, 3]);
    assert_eq!(dispatcher.stats().queued, 2);
    assert_eq!(dispatcher.stats().active, 1);

    for _ in 0..3 {
        open.send(()).unwrap();
    }
    drain(&dispatcher).await;
    assert_eq!(watcher.notified().len(), 1);
    assert_eq!(dispatcher.stats().total_completed, 3);

    dispatcher.stop();
    handle.await.unwrap();
}
