//! The event vocabulary of the notebook log.
//!
//! Every state change is an immutable event appended to the log. The
//! worker produces the session, assignment and execution events; the
//! cell and request events come from producers outside this crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{
    Capabilities, CellId, CellType, CompletionStatus, OutputId, OutputPayload, SessionId,
    SessionStatus, TerminationReason, WorkId,
};

/// An event as accepted by the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Position in the log. Starts at 1 and has no gaps.
    pub seq: u64,
    /// When the store accepted the event.
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "kebab-case")]
pub enum EventKind {
    // -- producer side --------------------------------------------------
    CellUpserted {
        cell_id: CellId,
        cell_type: CellType,
        source: String,
    },
    ExecutionRequested {
        work_id: WorkId,
        cell_id: CellId,
        priority: i32,
        requested_by: Option<String>,
    },

    // -- session lifecycle ------------------------------------------------
    SessionStarted {
        session_id: SessionId,
        runtime_id: String,
        kind: String,
        capabilities: Capabilities,
    },
    SessionHeartbeat {
        session_id: SessionId,
        status: SessionStatus,
        timestamp: DateTime<Utc>,
    },
    SessionTerminated {
        session_id: SessionId,
        reason: TerminationReason,
    },

    // -- claim and execution ----------------------------------------------
    WorkAssigned {
        work_id: WorkId,
        session_id: SessionId,
    },
    ExecutionStarted {
        work_id: WorkId,
        session_id: SessionId,
        started_at: DateTime<Utc>,
    },
    OutputsCleared {
        cell_id: CellId,
        cleared_by: SessionId,
    },
    OutputAdded {
        output_id: OutputId,
        cell_id: CellId,
        position: u32,
        payload: OutputPayload,
    },
    ExecutionCompleted {
        work_id: WorkId,
        status: CompletionStatus,
        error: Option<String>,
        completed_at: DateTime<Utc>,
        duration_ms: u64,
    },
}

impl EventKind {
    /// The event name as written to the log.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::CellUpserted { .. } => "cell-upserted",
            EventKind::ExecutionRequested { .. } => "execution-requested",
            EventKind::SessionStarted { .. } => "session-started",
            EventKind::SessionHeartbeat { .. } => "session-heartbeat",
            EventKind::SessionTerminated { .. } => "session-terminated",
            EventKind::WorkAssigned { .. } => "work-assigned",
            EventKind::ExecutionStarted { .. } => "execution-started",
            EventKind::OutputsCleared { .. } => "outputs-cleared",
            EventKind::OutputAdded { .. } => "output-added",
            EventKind::ExecutionCompleted { .. } => "execution-completed",
        }
    }
}
