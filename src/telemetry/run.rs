//! Run span helpers.

use tracing::Span;
use uuid::Uuid;

/// Start a span covering one run of the task loop.
///
/// `run.state` is declared empty and updated via [`record_run_transition`].
pub fn start_run_span(kind: &str, run_id: &Uuid, total: usize, start_index: usize) -> Span {
    tracing::info_span!(
        "probe.run",
        "run.kind" = kind,
        "run.id" = %run_id,
        "run.total" = total,
        "run.start_index" = start_index,
        "run.state" = tracing::field::Empty,
    )
}

/// Record a run state change on `span` and emit it as an event.
pub fn record_run_transition(span: &Span, from: &str, to: &str) {
    span.record("run.state", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "run_transition");
    });
}
