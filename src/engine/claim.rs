//! Claim coordinator: moves pending work onto this session.

use std::sync::Arc;

use opentelemetry::KeyValue;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::event::EventKind;
use crate::model::{SessionId, WorkId, WorkItem, WorkerSession};
use crate::store::{Commit, Rejection, Store, SubscriptionRows};
use crate::telemetry::metrics;

/// What one refresh did.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// This session is not (yet) visible in the active set.
    NotActive,
    /// Nothing pending.
    Idle,
    Claimed(WorkId),
    /// Another session's assignment landed first.
    Lost { work_id: WorkId, rejection: Rejection },
}

pub struct ClaimCoordinator {
    store: Arc<dyn Store>,
    session_id: SessionId,
}

impl ClaimCoordinator {
    pub fn new(store: Arc<dyn Store>, session_id: SessionId) -> Self {
        Self { store, session_id }
    }

    /// The item this session should try to claim, or why there is none.
    pub fn select<'a>(
        &self,
        pending: &'a [WorkItem],
        active: &[WorkerSession],
    ) -> std::result::Result<&'a WorkItem, ClaimOutcome> {
        if !active.iter().any(|s| s.id == self.session_id) {
            return Err(ClaimOutcome::NotActive);
        }
        pending.first().ok_or(ClaimOutcome::Idle)
    }

    /// Evaluate one refresh: at most one assignment commit.
    ///
    /// A rejected assignment is absorbed here; the next refresh sees the
    /// updated pending list and moves on.
    pub async fn refresh(
        &self,
        pending: &[WorkItem],
        active: &[WorkerSession],
    ) -> Result<ClaimOutcome> {
        let item = match self.select(pending, active) {
            Ok(item) => item,
            Err(outcome) => {
                if outcome == ClaimOutcome::NotActive {
                    debug!(session = %self.session_id, "not in active set yet, skipping claim");
                }
                return Ok(outcome);
            }
        };

        let commit = self
            .store
            .commit(EventKind::WorkAssigned {
                work_id: item.id.clone(),
                session_id: self.session_id.clone(),
            })
            .await;

        match commit {
            Ok(Commit::Accepted(_)) => {
                info!(
                    work = %item.id,
                    cell = %item.cell_id,
                    priority = item.priority,
                    session = %self.session_id,
                    "claimed work"
                );
                metrics::claims().add(1, &[KeyValue::new("result", "claimed")]);
                Ok(ClaimOutcome::Claimed(item.id.clone()))
            }
            Ok(Commit::Rejected(rejection)) => {
                debug!(work = %item.id, %rejection, "claim lost");
                metrics::claims().add(1, &[KeyValue::new("result", "lost")]);
                Ok(ClaimOutcome::Lost {
                    work_id: item.id.clone(),
                    rejection,
                })
            }
            Err(e) => {
                metrics::claims().add(1, &[KeyValue::new("result", "error")]);
                Err(e)
            }
        }
    }

    /// Follow the pending-work and active-session views until either
    /// subscription is released.
    pub async fn run(
        self,
        mut pending_rows: SubscriptionRows,
        mut session_rows: SubscriptionRows,
    ) -> Result<()> {
        let mut pending: Vec<WorkItem> = Vec::new();
        let mut active: Vec<WorkerSession> = Vec::new();

        loop {
            tokio::select! {
                rows = pending_rows.next() => match rows {
                    Some(rows) => pending = rows.into_work()?,
                    None => break,
                },
                rows = session_rows.next() => match rows {
                    Some(rows) => active = rows.into_sessions()?,
                    None => break,
                },
            }

            if let Err(e) = self.refresh(&pending, &active).await {
                warn!(session = %self.session_id, "claim attempt failed: {e}");
            }
        }

        debug!(session = %self.session_id, "claim coordinator stopped");
        Ok(())
    }
}
