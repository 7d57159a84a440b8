//! Metric instrument factories for planq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Every instrument is labelled with `worker`.

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("planq")
}

/// Label set shared by all dispatcher instruments.
pub fn worker_labels(worker: &str) -> [KeyValue; 1] {
    [KeyValue::new("worker", worker.to_string())]
}

/// Counter: tasks added to the queue (including retries).
pub fn tasks_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("planq.tasks.enqueued")
        .with_description("Number of tasks added to the work queue")
        .build()
}

/// Counter: tasks whose worker returned successfully.
pub fn tasks_completed() -> Counter<u64> {
    meter()
        .u64_counter("planq.tasks.completed")
        .with_description("Number of tasks completed successfully")
        .build()
}

/// Counter: tasks that exhausted their retries, plus failed notifications.
pub fn tasks_failed() -> Counter<u64> {
    meter()
        .u64_counter("planq.tasks.failed")
        .with_description("Number of terminal task and notification failures")
        .build()
}

/// Counter: failed tasks sent back to the queue.
pub fn tasks_retried() -> Counter<u64> {
    meter()
        .u64_counter("planq.tasks.retried")
        .with_description("Number of task retries")
        .build()
}

/// Counter: provenance prefixes whose count reached zero.
pub fn provenance_released() -> Counter<u64> {
    meter()
        .u64_counter("planq.provenance.released")
        .with_description("Number of provenance prefixes released")
        .build()
}

/// Counter: notify hook invocations.
pub fn watch_notifications() -> Counter<u64> {
    meter()
        .u64_counter("planq.watch.notifications")
        .with_description("Number of watcher notifications delivered")
        .build()
}

/// Histogram: hook execution time in milliseconds.
pub fn task_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("planq.task.duration_ms")
        .with_description("Worker hook duration in milliseconds")
        .with_unit("ms")
        .build()
}
