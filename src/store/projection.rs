//! Materialized projection of the notebook log.
//!
//! Both store adapters fold the same events through [`Projection::apply`]
//! and validate appends through [`Projection::check`], so the memory and
//! Postgres logs agree on what a conflicting commit is.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use super::{Rejection, Rows, Subscription, ViewQuery};
use crate::event::{Event, EventKind};
use crate::model::*;

#[derive(Debug, Default, Clone)]
pub struct Projection {
    head: u64,
    cells: HashMap<CellId, Cell>,
    work: HashMap<WorkId, WorkItem>,
    sessions: HashMap<SessionId, WorkerSession>,
    outputs: HashMap<CellId, Vec<ExecutionOutput>>,
}

impl Projection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number of the last applied event (0 when empty).
    pub fn head(&self) -> u64 {
        self.head
    }

    /// Would the log accept `kind` on top of the current state?
    pub fn check(&self, kind: &EventKind) -> Result<(), Rejection> {
        match kind {
            EventKind::CellUpserted { .. } | EventKind::OutputsCleared { .. } => Ok(()),
            EventKind::OutputAdded { .. } => Ok(()),
            EventKind::ExecutionRequested { work_id, .. } => {
                if self.work.contains_key(work_id) {
                    Err(Rejection::DuplicateWork(work_id.clone()))
                } else {
                    Ok(())
                }
            }
            EventKind::SessionStarted { session_id, .. } => {
                if self.sessions.contains_key(session_id) {
                    Err(Rejection::DuplicateSession(session_id.clone()))
                } else {
                    Ok(())
                }
            }
            EventKind::SessionHeartbeat { session_id, .. }
            | EventKind::SessionTerminated { session_id, .. } => {
                self.active_session(session_id).map(|_| ())
            }
            EventKind::WorkAssigned {
                work_id,
                session_id,
            } => {
                let item = self.work_item(work_id)?;
                if let Some(ref owner) = item.assigned_session {
                    return Err(Rejection::AlreadyAssigned {
                        work_id: work_id.clone(),
                        session_id: owner.clone(),
                    });
                }
                transition(item, State::Assigned)?;
                self.active_session(session_id).map(|_| ())
            }
            EventKind::ExecutionStarted {
                work_id,
                session_id,
                ..
            } => {
                let item = self.work_item(work_id)?;
                if item.assigned_session.as_ref() != Some(session_id) {
                    return Err(Rejection::NotAssignedTo {
                        work_id: work_id.clone(),
                        session_id: session_id.clone(),
                    });
                }
                transition(item, State::Running)
            }
            EventKind::ExecutionCompleted {
                work_id, status, ..
            } => {
                let item = self.work_item(work_id)?;
                transition(item, status.terminal_state())
            }
        }
    }

    /// Fold one accepted event into the projection.
    ///
    /// Events at or below the current head are ignored, so replaying an
    /// overlapping page of the log is harmless.
    pub fn apply(&mut self, event: &Event) {
        if event.seq <= self.head {
            return;
        }
        self.head = event.seq;

        match event.kind {
            EventKind::CellUpserted {
                ref cell_id,
                cell_type,
                ref source,
            } => {
                self.cells.insert(
                    cell_id.clone(),
                    Cell {
                        id: cell_id.clone(),
                        cell_type,
                        source: source.clone(),
                    },
                );
            }
            EventKind::ExecutionRequested {
                ref work_id,
                ref cell_id,
                priority,
                ref requested_by,
            } => {
                self.work.entry(work_id.clone()).or_insert_with(|| WorkItem {
                    id: work_id.clone(),
                    cell_id: cell_id.clone(),
                    priority,
                    state: State::Pending,
                    assigned_session: None,
                    requested_by: requested_by.clone(),
                    requested_at: event.timestamp,
                    started_at: None,
                    completed_at: None,
                    duration_ms: None,
                    error: None,
                    request_seq: event.seq,
                });
            }
            EventKind::SessionStarted {
                ref session_id,
                ref runtime_id,
                ref kind,
                capabilities,
            } => {
                self.sessions.insert(
                    session_id.clone(),
                    WorkerSession {
                        id: session_id.clone(),
                        runtime_id: runtime_id.clone(),
                        kind: kind.clone(),
                        capabilities,
                        status: SessionStatus::Ready,
                        is_active: true,
                        started_at: event.timestamp,
                        last_heartbeat: event.timestamp,
                        termination: None,
                    },
                );
            }
            EventKind::SessionHeartbeat {
                ref session_id,
                status,
                timestamp,
            } => {
                if let Some(session) = self.sessions.get_mut(session_id) {
                    session.status = status;
                    session.last_heartbeat = timestamp;
                }
            }
            EventKind::SessionTerminated {
                ref session_id,
                ref reason,
            } => {
                if let Some(session) = self.sessions.get_mut(session_id) {
                    session.status = SessionStatus::Terminated;
                    session.is_active = false;
                    session.termination = Some(reason.clone());
                }
            }
            EventKind::WorkAssigned {
                ref work_id,
                ref session_id,
            } => {
                if let Some(item) = self.work.get_mut(work_id) {
                    if item.assigned_session.is_none() {
                        item.assigned_session = Some(session_id.clone());
                        item.state = State::Assigned;
                    }
                }
            }
            EventKind::ExecutionStarted {
                ref work_id,
                started_at,
                ..
            } => {
                if let Some(item) = self.work.get_mut(work_id) {
                    item.state = State::Running;
                    item.started_at = Some(started_at);
                }
            }
            EventKind::OutputsCleared { ref cell_id, .. } => {
                self.outputs.remove(cell_id);
            }
            EventKind::OutputAdded {
                ref output_id,
                ref cell_id,
                position,
                ref payload,
            } => {
                let outputs = self.outputs.entry(cell_id.clone()).or_default();
                outputs.push(ExecutionOutput {
                    id: output_id.clone(),
                    cell_id: cell_id.clone(),
                    position,
                    payload: payload.clone(),
                });
                outputs.sort_by_key(|o| o.position);
            }
            EventKind::ExecutionCompleted {
                ref work_id,
                status,
                ref error,
                completed_at,
                duration_ms,
            } => {
                if let Some(item) = self.work.get_mut(work_id) {
                    if !item.state.is_terminal() {
                        item.state = status.terminal_state();
                        item.error = error.clone();
                        item.completed_at = Some(completed_at);
                        item.duration_ms = Some(duration_ms);
                    }
                }
            }
        }
    }

    /// Evaluate a query against the current state.
    pub fn evaluate(&self, query: &ViewQuery) -> Rows {
        match query {
            ViewQuery::PendingWork => {
                let mut rows: Vec<WorkItem> = self
                    .work
                    .values()
                    .filter(|w| w.state == State::Pending)
                    .cloned()
                    .collect();
                sort_by_priority(&mut rows);
                Rows::Work(rows)
            }
            ViewQuery::AssignedWork { session_id } => {
                let mut rows: Vec<WorkItem> = self
                    .work
                    .values()
                    .filter(|w| {
                        w.state == State::Assigned
                            && w.assigned_session.as_ref() == Some(session_id)
                    })
                    .cloned()
                    .collect();
                sort_by_priority(&mut rows);
                Rows::Work(rows)
            }
            ViewQuery::AllWork => {
                let mut rows: Vec<WorkItem> = self.work.values().cloned().collect();
                rows.sort_by_key(|w| w.request_seq);
                Rows::Work(rows)
            }
            ViewQuery::ActiveSessions => {
                let mut rows: Vec<WorkerSession> = self
                    .sessions
                    .values()
                    .filter(|s| s.is_active)
                    .cloned()
                    .collect();
                rows.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
                Rows::Sessions(rows)
            }
            ViewQuery::AllSessions => {
                let mut rows: Vec<WorkerSession> = self.sessions.values().cloned().collect();
                rows.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(a.id.cmp(&b.id)));
                Rows::Sessions(rows)
            }
            ViewQuery::Cell { cell_id } => {
                Rows::Cells(self.cells.get(cell_id).cloned().into_iter().collect())
            }
            ViewQuery::CellOutputs { cell_id } => {
                Rows::Outputs(self.outputs.get(cell_id).cloned().unwrap_or_default())
            }
        }
    }

    fn work_item(&self, id: &WorkId) -> Result<&WorkItem, Rejection> {
        self.work
            .get(id)
            .ok_or_else(|| Rejection::UnknownWork(id.clone()))
    }

    fn active_session(&self, id: &SessionId) -> Result<&WorkerSession, Rejection> {
        match self.sessions.get(id) {
            Some(session) if session.is_active => Ok(session),
            Some(_) => Err(Rejection::InactiveSession(id.clone())),
            None => Err(Rejection::UnknownSession(id.clone())),
        }
    }
}

fn transition(item: &WorkItem, to: State) -> Result<(), Rejection> {
    if item.state.can_transition_to(to) {
        Ok(())
    } else {
        Err(Rejection::InvalidTransition {
            work_id: item.id.clone(),
            from: item.state,
            to,
        })
    }
}

fn sort_by_priority(rows: &mut [WorkItem]) {
    rows.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.request_seq.cmp(&b.request_seq))
    });
}

// ---------------------------------------------------------------------------
// Shared view
// ---------------------------------------------------------------------------

/// A projection shared between a store and its subscription feeds.
///
/// The head watch channel ticks after every applied event; feeds wake on
/// it and re-evaluate their query.
pub(crate) struct SharedView {
    projection: Mutex<Projection>,
    head: watch::Sender<u64>,
}

impl SharedView {
    pub(crate) fn new() -> Arc<Self> {
        let (head, _) = watch::channel(0);
        Arc::new(Self {
            projection: Mutex::new(Projection::new()),
            head,
        })
    }

    pub(crate) fn head(&self) -> u64 {
        self.projection.lock().head()
    }

    pub(crate) fn evaluate(&self, query: &ViewQuery) -> Rows {
        self.projection.lock().evaluate(query)
    }

    pub(crate) fn check(&self, kind: &EventKind) -> Result<u64, Rejection> {
        let projection = self.projection.lock();
        projection.check(kind)?;
        Ok(projection.head())
    }

    /// Validate and apply in one critical section: the in-process
    /// compare-and-append.
    pub(crate) fn append(&self, kind: EventKind, now: DateTime<Utc>) -> Result<Event, Rejection> {
        let event = {
            let mut projection = self.projection.lock();
            projection.check(&kind)?;
            let event = Event {
                seq: projection.head() + 1,
                timestamp: now,
                kind,
            };
            projection.apply(&event);
            event
        };
        self.head.send_replace(event.seq);
        Ok(event)
    }

    /// Apply events read back from a durable log.
    pub(crate) fn apply_all(&self, events: &[Event]) {
        if events.is_empty() {
            return;
        }
        let head = {
            let mut projection = self.projection.lock();
            for event in events {
                projection.apply(event);
            }
            projection.head()
        };
        self.head.send_replace(head);
    }

    /// Start a feed task that pushes the query's rows on every head change.
    pub(crate) fn subscribe(self: &Arc<Self>, query: ViewQuery) -> Subscription {
        let (tx, rx) = mpsc::channel(1);
        let mut head = self.head.subscribe();
        let view = Arc::clone(self);
        let feed_query = query.clone();

        let feed = tokio::spawn(async move {
            loop {
                let _ = head.borrow_and_update();
                let rows = view.evaluate(&feed_query);
                if tx.send(rows).await.is_err() {
                    break;
                }
                if head.changed().await.is_err() {
                    break;
                }
            }
        });

        Subscription::new(query, rx, feed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(seq: u64, kind: EventKind) -> Event {
        Event {
            seq,
            timestamp: Utc::now(),
            kind,
        }
    }

    fn request(seq: u64, id: &str, priority: i32) -> Event {
        event(
            seq,
            EventKind::ExecutionRequested {
                work_id: id.into(),
                cell_id: "c1".into(),
                priority,
                requested_by: None,
            },
        )
    }

    #[test]
    fn pending_work_orders_by_priority_then_request() {
        let mut p = Projection::new();
        p.apply(&request(1, "low", 1));
        p.apply(&request(2, "high-late", 9));
        p.apply(&request(3, "high-later", 9));

        let ids: Vec<String> = p
            .evaluate(&ViewQuery::PendingWork)
            .into_work()
            .unwrap()
            .into_iter()
            .map(|w| w.id.0)
            .collect();
        assert_eq!(ids, ["high-late", "high-later", "low"]);
    }

    #[test]
    fn replayed_events_are_ignored() {
        let mut p = Projection::new();
        p.apply(&request(1, "w1", 1));
        p.apply(&request(1, "w-dup", 1));
        assert_eq!(p.head(), 1);
        assert_eq!(p.evaluate(&ViewQuery::AllWork).into_work().unwrap().len(), 1);
    }

    #[test]
    fn assignment_requires_active_session() {
        let mut p = Projection::new();
        p.apply(&request(1, "w1", 1));

        let assign = EventKind::WorkAssigned {
            work_id: "w1".into(),
            session_id: "s1".into(),
        };
        assert_eq!(
            p.check(&assign),
            Err(Rejection::UnknownSession("s1".into()))
        );
    }

    #[test]
    fn completion_is_accepted_once() {
        let mut p = Projection::new();
        p.apply(&request(1, "w1", 1));
        p.apply(&event(
            2,
            EventKind::SessionStarted {
                session_id: "s1".into(),
                runtime_id: "rt".into(),
                kind: "echo".into(),
                capabilities: Capabilities::default(),
            },
        ));
        p.apply(&event(
            3,
            EventKind::WorkAssigned {
                work_id: "w1".into(),
                session_id: "s1".into(),
            },
        ));

        let done = EventKind::ExecutionCompleted {
            work_id: "w1".into(),
            status: CompletionStatus::Failure,
            error: Some("boom".into()),
            completed_at: Utc::now(),
            duration_ms: 0,
        };
        assert!(p.check(&done).is_ok());
        p.apply(&event(4, done.clone()));
        assert!(matches!(
            p.check(&done),
            Err(Rejection::InvalidTransition { .. })
        ));
    }
}
