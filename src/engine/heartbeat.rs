//! Liveness publisher: periodic `session-heartbeat` commits.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use opentelemetry::KeyValue;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::error::Result;
use crate::event::EventKind;
use crate::model::{SessionId, SessionStatus};
use crate::store::{Commit, Store};
use crate::telemetry::metrics;

pub struct LivenessPublisher {
    store: Arc<dyn Store>,
    session_id: SessionId,
    period: Duration,
    shutting_down: Arc<AtomicBool>,
}

impl LivenessPublisher {
    pub fn new(
        store: Arc<dyn Store>,
        session_id: SessionId,
        period: Duration,
        shutting_down: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            session_id,
            period,
            shutting_down,
        }
    }

    /// Commit one heartbeat now.
    pub async fn beat(&self) -> Result<Commit> {
        let commit = self
            .store
            .commit(EventKind::SessionHeartbeat {
                session_id: self.session_id.clone(),
                status: SessionStatus::Ready,
                timestamp: Utc::now(),
            })
            .await;

        let result = match &commit {
            Ok(Commit::Accepted(_)) => "ok",
            Ok(Commit::Rejected(_)) => "rejected",
            Err(_) => "error",
        };
        metrics::heartbeats().add(1, &[KeyValue::new("result", result)]);
        commit
    }

    /// Heartbeat every period until shutdown starts or the task is aborted.
    ///
    /// The first beat fires one period from now; startup commits its own.
    /// Failures are logged and the next tick tries again.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + self.period,
                self.period,
            );
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if self.shutting_down.load(Ordering::SeqCst) {
                    break;
                }
                match self.beat().await {
                    Ok(Commit::Accepted(_)) => {
                        debug!(session = %self.session_id, "heartbeat");
                    }
                    Ok(Commit::Rejected(rejection)) => {
                        warn!(session = %self.session_id, %rejection, "heartbeat rejected");
                    }
                    Err(e) => {
                        warn!(session = %self.session_id, "heartbeat failed: {e}");
                    }
                }
            }
        })
    }
}
