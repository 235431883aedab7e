//! Execution engine: runs each item assigned to this session exactly once.
//!
//! Per item the engine commits, in order: `execution-started`,
//! `outputs-cleared`, one `output-added` per output (positions from 0),
//! and a single `execution-completed`. Any failure before completion is
//! turned into a failure completion for that item alone.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tracing::{Instrument, Span, debug, error, info, warn};

use super::ledger::DedupLedger;
use crate::compute::{Computation, run_contained};
use crate::error::{Error, Result};
use crate::event::EventKind;
use crate::model::{
    Capabilities, Cell, CompletionStatus, OutputId, SessionId, State, WorkId, WorkItem,
};
use crate::store::{Commit, Store, SubscriptionRows, ViewQuery};
use crate::telemetry::metrics;
use crate::telemetry::work::{record_state_transition, start_work_span};

/// What happened to one item.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub work_id: WorkId,
    pub status: CompletionStatus,
    pub error: Option<String>,
    pub outputs: u32,
    pub duration_ms: u64,
    /// Whether the completion event made it into the log.
    pub recorded: bool,
}

pub struct ExecutionEngine {
    store: Arc<dyn Store>,
    session_id: SessionId,
    capabilities: Capabilities,
    computation: Arc<dyn Computation>,
    ledger: Arc<DedupLedger>,
}

impl ExecutionEngine {
    pub fn new(
        store: Arc<dyn Store>,
        session_id: SessionId,
        capabilities: Capabilities,
        computation: Arc<dyn Computation>,
        ledger: Arc<DedupLedger>,
    ) -> Self {
        Self {
            store,
            session_id,
            capabilities,
            computation,
            ledger,
        }
    }

    /// Handle one refresh of the assigned-work view.
    ///
    /// Every unseen item is recorded in the ledger before any of them
    /// starts; items already in the ledger are skipped.
    pub async fn refresh(&self, assigned: &[WorkItem]) -> Vec<ExecutionReport> {
        let fresh: Vec<&WorkItem> = assigned
            .iter()
            .filter(|item| {
                let new = self.ledger.record(&item.id);
                if !new {
                    debug!(work = %item.id, "already handled, skipping");
                }
                new
            })
            .collect();

        let mut reports = Vec::with_capacity(fresh.len());
        for item in fresh {
            reports.push(self.execute(item).await);
        }
        reports
    }

    /// Follow the assigned-work view until the subscription is released.
    pub async fn run(self, mut assigned_rows: SubscriptionRows) -> Result<()> {
        while let Some(rows) = assigned_rows.next().await {
            let items = rows.into_work()?;
            self.refresh(&items).await;
        }
        debug!(session = %self.session_id, "execution engine stopped");
        Ok(())
    }

    async fn execute(&self, item: &WorkItem) -> ExecutionReport {
        let started_at = Utc::now();
        let span = start_work_span(&item.id, &item.cell_id, &self.session_id);

        let mut reached = State::Assigned;
        let result = self
            .run_steps(item, started_at, &mut reached)
            .instrument(span.clone())
            .await;

        let completed_at = Utc::now();
        let duration_ms = completed_at
            .signed_duration_since(started_at)
            .num_milliseconds()
            .max(0) as u64;

        let (status, error, outputs) = match result {
            Ok(outputs) => (CompletionStatus::Success, None, outputs),
            Err(e) => {
                warn!(parent: &span, work = %item.id, error = %e, "execution failed");
                (CompletionStatus::Failure, Some(e.to_string()), 0)
            }
        };
        record_state_transition(
            &span,
            &reached.to_string(),
            &status.terminal_state().to_string(),
        );

        let commit = self
            .store
            .commit(EventKind::ExecutionCompleted {
                work_id: item.id.clone(),
                status,
                error: error.clone(),
                completed_at,
                duration_ms,
            })
            .instrument(span.clone())
            .await;

        // A lost completion leaves the item without a terminal event;
        // the operator has to see it.
        let recorded = match commit {
            Ok(Commit::Accepted(_)) => true,
            Ok(Commit::Rejected(rejection)) => {
                error!(parent: &span, work = %item.id, %rejection, "completion rejected");
                false
            }
            Err(e) => {
                error!(parent: &span, work = %item.id, error = %e, "completion commit failed");
                false
            }
        };

        metrics::executions().add(1, &[KeyValue::new("status", status.as_str())]);
        metrics::execution_duration_ms().record(
            duration_ms as f64,
            &[KeyValue::new("status", status.as_str())],
        );
        info!(
            parent: &span,
            work = %item.id,
            status = status.as_str(),
            outputs,
            duration_ms,
            "execution finished"
        );

        ExecutionReport {
            work_id: item.id.clone(),
            status,
            error,
            outputs,
            duration_ms,
            recorded,
        }
    }

    async fn run_steps(
        &self,
        item: &WorkItem,
        started_at: DateTime<Utc>,
        reached: &mut State,
    ) -> Result<u32> {
        let cell = self.resolve(item).await?;

        self.store
            .commit(EventKind::ExecutionStarted {
                work_id: item.id.clone(),
                session_id: self.session_id.clone(),
                started_at,
            })
            .await?
            .accepted()?;
        *reached = State::Running;
        record_state_transition(&Span::current(), "assigned", "running");

        self.store
            .commit(EventKind::OutputsCleared {
                cell_id: cell.id.clone(),
                cleared_by: self.session_id.clone(),
            })
            .await?
            .accepted()?;

        let outputs = run_contained(Arc::clone(&self.computation), cell.clone()).await?;
        let mut position: u32 = 0;
        for payload in outputs {
            self.store
                .commit(EventKind::OutputAdded {
                    output_id: OutputId::generate(),
                    cell_id: cell.id.clone(),
                    position,
                    payload,
                })
                .await?
                .accepted()?;
            position += 1;
        }
        Ok(position)
    }

    async fn resolve(&self, item: &WorkItem) -> Result<Cell> {
        let cell = self
            .store
            .query(&ViewQuery::Cell {
                cell_id: item.cell_id.clone(),
            })
            .await?
            .into_cells()?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("cell {}", item.cell_id)))?;

        if !self.capabilities.supports(cell.cell_type) {
            return Err(Error::Execution(format!(
                "{} cells are not supported by this runtime",
                cell.cell_type.as_str()
            )));
        }
        Ok(cell)
    }
}
