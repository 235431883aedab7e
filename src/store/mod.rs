//! Store client: the worker's view of the event-sourced notebook log.
//!
//! A store answers queries against its materialized projection, pushes
//! fresh results to subscribers whenever the log head moves, and appends
//! events with compare-and-append semantics. A rejected append is a
//! normal outcome ([`Commit::Rejected`]), not an error.

pub mod memory;
pub mod postgres;
pub mod projection;

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::model::*;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use projection::Projection;

/// A predicate + ordering over the materialized projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewQuery {
    /// Unassigned work, highest priority first, then request order.
    PendingWork,
    /// Work assigned to the session and not yet started.
    AssignedWork { session_id: SessionId },
    /// Sessions that registered and have not terminated.
    ActiveSessions,
    /// Every session ever registered, newest first.
    AllSessions,
    /// Every work item, in request order.
    AllWork,
    /// Zero or one cell.
    Cell { cell_id: CellId },
    /// Current outputs of a cell, by position.
    CellOutputs { cell_id: CellId },
}

/// Rows returned for a [`ViewQuery`].
#[derive(Debug, Clone, PartialEq)]
pub enum Rows {
    Work(Vec<WorkItem>),
    Sessions(Vec<WorkerSession>),
    Cells(Vec<Cell>),
    Outputs(Vec<ExecutionOutput>),
}

impl Rows {
    pub fn into_work(self) -> Result<Vec<WorkItem>> {
        match self {
            Rows::Work(rows) => Ok(rows),
            other => Err(mismatch("work", &other)),
        }
    }

    pub fn into_sessions(self) -> Result<Vec<WorkerSession>> {
        match self {
            Rows::Sessions(rows) => Ok(rows),
            other => Err(mismatch("sessions", &other)),
        }
    }

    pub fn into_cells(self) -> Result<Vec<Cell>> {
        match self {
            Rows::Cells(rows) => Ok(rows),
            other => Err(mismatch("cells", &other)),
        }
    }

    pub fn into_outputs(self) -> Result<Vec<ExecutionOutput>> {
        match self {
            Rows::Outputs(rows) => Ok(rows),
            other => Err(mismatch("outputs", &other)),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Rows::Work(_) => "work",
            Rows::Sessions(_) => "sessions",
            Rows::Cells(_) => "cells",
            Rows::Outputs(_) => "outputs",
        }
    }
}

fn mismatch(expected: &str, got: &Rows) -> Error {
    Error::Other(format!("expected {expected} rows, got {}", got.label()))
}

/// Why the log refused an append.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("work item {0} does not exist")]
    UnknownWork(WorkId),

    #[error("work item {0} already exists")]
    DuplicateWork(WorkId),

    #[error("work item {work_id} is already assigned to {session_id}")]
    AlreadyAssigned {
        work_id: WorkId,
        session_id: SessionId,
    },

    #[error("work item {work_id} is not assigned to {session_id}")]
    NotAssignedTo {
        work_id: WorkId,
        session_id: SessionId,
    },

    #[error("work item {work_id} cannot move from {from} to {to}")]
    InvalidTransition { work_id: WorkId, from: State, to: State },

    #[error("session {0} does not exist")]
    UnknownSession(SessionId),

    #[error("session {0} already exists")]
    DuplicateSession(SessionId),

    #[error("session {0} is not active")]
    InactiveSession(SessionId),
}

/// Outcome of an append.
#[derive(Debug, Clone, PartialEq)]
pub enum Commit {
    Accepted(Event),
    Rejected(Rejection),
}

impl Commit {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Commit::Accepted(_))
    }

    /// Turn a rejection into an error, for steps where it is one.
    pub fn accepted(self) -> Result<Event> {
        match self {
            Commit::Accepted(event) => Ok(event),
            Commit::Rejected(rejection) => Err(Error::Rejected(rejection)),
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Current rows matching the query.
    async fn query(&self, query: &ViewQuery) -> Result<Rows>;

    /// Push the query's rows now and after every change to the log.
    async fn subscribe(&self, query: ViewQuery) -> Result<Subscription>;

    /// Append one event, validated against the current projection.
    async fn commit(&self, event: EventKind) -> Result<Commit>;

    /// Release the underlying connection. Later commits fail.
    async fn close(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

/// A live query. Split it to hand the receiving side to a consumer task
/// while the owner keeps the handle to cancel it.
pub struct Subscription {
    rows: SubscriptionRows,
    handle: SubscriptionHandle,
}

/// Receiving half of a [`Subscription`].
pub struct SubscriptionRows {
    query: ViewQuery,
    rx: mpsc::Receiver<Rows>,
}

/// Cancel half of a [`Subscription`].
pub struct SubscriptionHandle {
    query: ViewQuery,
    feed: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn new(query: ViewQuery, rx: mpsc::Receiver<Rows>, feed: JoinHandle<()>) -> Self {
        Self {
            rows: SubscriptionRows {
                query: query.clone(),
                rx,
            },
            handle: SubscriptionHandle { query, feed },
        }
    }

    pub fn split(self) -> (SubscriptionRows, SubscriptionHandle) {
        (self.rows, self.handle)
    }

    pub async fn next(&mut self) -> Option<Rows> {
        self.rows.next().await
    }
}

impl SubscriptionRows {
    /// Next refresh, or `None` once unsubscribed or the store is gone.
    pub async fn next(&mut self) -> Option<Rows> {
        self.rx.recv().await
    }

    pub fn query(&self) -> &ViewQuery {
        &self.query
    }
}

impl SubscriptionHandle {
    /// Stop delivering refreshes. A refresh already received keeps running.
    pub fn unsubscribe(self) {
        tracing::debug!(query = ?self.query, "unsubscribed");
        self.feed.abort();
    }

    pub fn query(&self) -> &ViewQuery {
        &self.query
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.feed.abort();
    }
}

// ---------------------------------------------------------------------------
// Connecting
// ---------------------------------------------------------------------------

/// Open the store the configuration points at.
///
/// With a `DATABASE_URL` this is the shared Postgres log for the notebook;
/// without one the worker runs against a process-local log.
pub async fn connect(config: &Config) -> Result<Arc<dyn Store>> {
    match config.database_url {
        Some(ref url) => {
            let store =
                PgStore::connect(url.expose_secret(), &config.auth_token, &config.notebook_id)
                    .await?;
            store.migrate().await?;
            store.start_listener().await?;
            Ok(store)
        }
        None => {
            tracing::warn!(
                notebook = %config.notebook_id,
                "no DATABASE_URL set, using a process-local in-memory log"
            );
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Producer helper: upsert a cell and request its execution.
pub async fn submit_cell(
    store: &dyn Store,
    cell: Cell,
    priority: i32,
    requested_by: Option<String>,
) -> Result<WorkId> {
    let work_id = WorkId::generate();
    store
        .commit(EventKind::CellUpserted {
            cell_id: cell.id.clone(),
            cell_type: cell.cell_type,
            source: cell.source,
        })
        .await?
        .accepted()?;
    store
        .commit(EventKind::ExecutionRequested {
            work_id: work_id.clone(),
            cell_id: cell.id,
            priority,
            requested_by,
        })
        .await?
        .accepted()?;
    Ok(work_id)
}
