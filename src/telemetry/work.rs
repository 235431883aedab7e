//! Work execution span helpers.

use tracing::Span;

use crate::model::{CellId, SessionId, WorkId};

/// Start a span covering one work item from resolution to completion.
///
/// `work.state` is declared empty and filled in by
/// [`record_state_transition`].
pub fn start_work_span(work_id: &WorkId, cell_id: &CellId, session_id: &SessionId) -> Span {
    tracing::info_span!(
        "work.execute",
        "work.id" = %work_id,
        "work.cell" = %cell_id,
        "session.id" = %session_id,
        "work.state" = tracing::field::Empty,
    )
}

/// Record a state transition on the span, as a field and as an event.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("work.state", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
