//! Core data model.
//!
//! Rows here are never written directly. They are what the store
//! materializes by folding the event log, and what the engine reads
//! back through queries and subscriptions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Identifier of a work item (an execution request).
    WorkId
);
string_id!(
    /// Identifier of a notebook cell, the target of a work item.
    CellId
);
string_id!(
    /// Identifier of one worker session. Unique per process start.
    SessionId
);
string_id!(
    /// Identifier of a single execution output.
    OutputId
);

impl WorkId {
    pub fn generate() -> Self {
        Self(format!("work-{}", Uuid::new_v4()))
    }
}

impl CellId {
    pub fn generate() -> Self {
        Self(format!("cell-{}", Uuid::new_v4()))
    }
}

impl SessionId {
    /// Derive a session id from a stable runtime identity.
    ///
    /// The random suffix keeps restarts of the same runtime from colliding
    /// with the sessions they replace.
    pub fn for_runtime(runtime_id: &str) -> Self {
        Self(format!("{runtime_id}-{}", Uuid::new_v4().simple()))
    }
}

impl OutputId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// A request to execute one cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkId,

    /// The cell this item executes.
    pub cell_id: CellId,

    /// Higher runs first.
    pub priority: i32,

    pub state: State,

    /// Set once, by the first accepted `work-assigned` event.
    pub assigned_session: Option<SessionId>,

    /// Who asked for the execution (user, tool, another runtime).
    pub requested_by: Option<String>,

    pub requested_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,

    /// Log position of the request, used to break priority ties.
    pub request_seq: u64,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a work item, derived from the events applied to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Requested, waiting for a session to claim it.
    Pending,
    /// Bound to exactly one session.
    Assigned,
    /// The assigned session has started executing it.
    Running,
    /// Done successfully. Terminal.
    Completed,
    /// Done with an error. Terminal.
    Failed,
}

impl State {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: State) -> bool {
        use State::*;
        matches!(
            (self, to),
            (Pending, Assigned)
                | (Assigned, Running)
                | (Assigned, Failed) // target vanished before start
                | (Assigned, Completed)
                | (Running, Completed)
                | (Running, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, State::Completed | State::Failed)
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            State::Pending => "pending",
            State::Assigned => "assigned",
            State::Running => "running",
            State::Completed => "completed",
            State::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for State {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(State::Pending),
            "assigned" => Ok(State::Assigned),
            "running" => Ok(State::Running),
            "completed" => Ok(State::Completed),
            "failed" => Ok(State::Failed),
            other => Err(crate::error::Error::Other(format!(
                "unknown work state: {other}"
            ))),
        }
    }
}

/// Terminal status carried by `execution-completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Success,
    Failure,
}

impl CompletionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CompletionStatus::Success => "success",
            CompletionStatus::Failure => "failure",
        }
    }

    pub(crate) fn terminal_state(self) -> State {
        match self {
            CompletionStatus::Success => State::Completed,
            CompletionStatus::Failure => State::Failed,
        }
    }
}

// ---------------------------------------------------------------------------
// Worker Session
// ---------------------------------------------------------------------------

/// What a worker declares it can execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub can_execute_code: bool,
    #[serde(default)]
    pub can_execute_sql: bool,
    #[serde(default)]
    pub can_execute_ai: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            can_execute_code: true,
            can_execute_sql: false,
            can_execute_ai: false,
        }
    }
}

impl Capabilities {
    /// Does this capability set cover the given cell type?
    pub fn supports(&self, cell_type: CellType) -> bool {
        match cell_type {
            CellType::Code => self.can_execute_code,
            CellType::Sql => self.can_execute_sql,
            CellType::Ai => self.can_execute_ai,
            CellType::Markdown => false,
        }
    }
}

/// Status reported in heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Ready,
    Terminated,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Ready => "ready",
            SessionStatus::Terminated => "terminated",
        };
        write!(f, "{s}")
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum TerminationReason {
    /// Normal, requested shutdown.
    Shutdown,
    /// Interrupt or termination signal.
    Signal(String),
    /// An unhandled error or panic.
    Error(String),
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationReason::Shutdown => write!(f, "shutdown"),
            TerminationReason::Signal(sig) => write!(f, "signal: {sig}"),
            TerminationReason::Error(e) => write!(f, "error: {e}"),
        }
    }
}

/// One registration of a worker against a notebook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSession {
    pub id: SessionId,
    /// Stable identity of the worker across restarts.
    pub runtime_id: String,
    /// Worker kind, e.g. "python3" or "echo".
    pub kind: String,
    pub capabilities: Capabilities,
    pub status: SessionStatus,
    pub is_active: bool,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub termination: Option<TerminationReason>,
}

impl WorkerSession {
    /// Has this session heartbeated within `timeout` of `now`?
    pub fn is_live(&self, now: DateTime<Utc>, timeout: std::time::Duration) -> bool {
        if !self.is_active {
            return false;
        }
        let age = now.signed_duration_since(self.last_heartbeat);
        age.to_std().map(|age| age <= timeout).unwrap_or(true)
    }
}

// ---------------------------------------------------------------------------
// Cells and outputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellType {
    Code,
    Markdown,
    Sql,
    Ai,
}

impl CellType {
    pub fn as_str(self) -> &'static str {
        match self {
            CellType::Code => "code",
            CellType::Markdown => "markdown",
            CellType::Sql => "sql",
            CellType::Ai => "ai",
        }
    }
}

/// A notebook cell: the unit of work a work item executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub id: CellId,
    pub cell_type: CellType,
    pub source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamName {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Result,
    Stream,
    Error,
}

impl OutputKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputKind::Result => "result",
            OutputKind::Stream => "stream",
            OutputKind::Error => "error",
        }
    }
}

/// Kind-tagged output payload produced by a computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum OutputPayload {
    Result(serde_json::Value),
    Stream { name: StreamName, text: String },
    Error { name: String, message: String },
}

impl OutputPayload {
    pub fn kind(&self) -> OutputKind {
        match self {
            OutputPayload::Result(_) => OutputKind::Result,
            OutputPayload::Stream { .. } => OutputKind::Stream,
            OutputPayload::Error { .. } => OutputKind::Error,
        }
    }

    pub fn text(value: impl Into<String>) -> Self {
        OutputPayload::Result(serde_json::Value::String(value.into()))
    }
}

/// One output of a cell execution, at a fixed position in the cell's
/// output sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    pub id: OutputId,
    pub cell_id: CellId,
    pub position: u32,
    pub payload: OutputPayload,
}
