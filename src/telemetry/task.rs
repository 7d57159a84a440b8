//! Task execution span helpers.

use tracing::Span;

/// Start a span for one hook execution.
///
/// `kind` is "task" or "notify".
pub fn start_task_span(worker: &str, task_id: u64, kind: &str) -> Span {
    tracing::info_span!(
        "planq.execute",
        "planq.worker" = worker,
        "planq.task_id" = task_id,
        "planq.kind" = kind,
        "planq.state" = tracing::field::Empty,
    )
}

/// Record a state transition event on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("planq.state", to);
    span.in_scope(|| {
        tracing::debug!(from = from, to = to, "state_transition");
    });
}
