//! Session lifecycle: register, run the components, tear down once.
//!
//! ```text
//! starting ──register+heartbeat──▶ active ──shutdown()──▶ shutting-down ──▶ terminated
//! ```
//!
//! Registration failure is fatal and leaves nothing to clean up. Teardown
//! runs at most once no matter how many triggers fire; each step is best
//! effort and a failing step does not block the next.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::claim::ClaimCoordinator;
use super::execute::ExecutionEngine;
use super::heartbeat::LivenessPublisher;
use super::ledger::DedupLedger;
use crate::compute::{Computation, WorkerProfile};
use crate::error::{Error, Result};
use crate::event::EventKind;
use crate::model::{Capabilities, SessionId, TerminationReason};
use crate::store::{Commit, Store, SubscriptionHandle, ViewQuery};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Active,
    ShuttingDown,
    Terminated,
}

/// Identity and timing of one worker session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub runtime_id: String,
    pub kind: String,
    pub capabilities: Capabilities,
    pub heartbeat_interval: Duration,
}

impl SessionConfig {
    pub fn new(runtime_id: impl Into<String>, profile: &WorkerProfile, heartbeat: Duration) -> Self {
        Self {
            runtime_id: runtime_id.into(),
            kind: profile.kind.clone(),
            capabilities: profile.capabilities,
            heartbeat_interval: heartbeat,
        }
    }
}

/// Everything started by [`SessionManager::start`] that teardown stops.
struct Running {
    heartbeat: JoinHandle<()>,
    subscriptions: Vec<SubscriptionHandle>,
}

pub struct SessionManager {
    store: Arc<dyn Store>,
    session_id: SessionId,
    config: SessionConfig,
    computation: Arc<dyn Computation>,
    ledger: Arc<DedupLedger>,
    phase: Mutex<Phase>,
    registered: AtomicBool,
    shutting_down: Arc<AtomicBool>,
    requested: watch::Sender<Option<TerminationReason>>,
    running: Mutex<Option<Running>>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn Store>,
        config: SessionConfig,
        computation: Arc<dyn Computation>,
    ) -> Arc<Self> {
        let (requested, _) = watch::channel(None);
        Arc::new(Self {
            store,
            session_id: SessionId::for_runtime(&config.runtime_id),
            config,
            computation,
            ledger: Arc::new(DedupLedger::new()),
            phase: Mutex::new(Phase::Starting),
            registered: AtomicBool::new(false),
            shutting_down: Arc::new(AtomicBool::new(false)),
            requested,
            running: Mutex::new(None),
        })
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    pub fn ledger(&self) -> &Arc<DedupLedger> {
        &self.ledger
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Register the session and start claiming, executing and heartbeating.
    ///
    /// # Errors
    ///
    /// `Error::Registration` if the registration commit fails or is
    /// rejected. Nothing has been started in that case.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let registration = self
            .store
            .commit(EventKind::SessionStarted {
                session_id: self.session_id.clone(),
                runtime_id: self.config.runtime_id.clone(),
                kind: self.config.kind.clone(),
                capabilities: self.config.capabilities,
            })
            .await
            .map_err(|e| Error::Registration(e.to_string()))?;
        if let Commit::Rejected(rejection) = registration {
            return Err(Error::Registration(rejection.to_string()));
        }
        self.registered.store(true, Ordering::SeqCst);
        info!(
            session = %self.session_id,
            runtime = %self.config.runtime_id,
            kind = %self.config.kind,
            "session registered"
        );

        let publisher = LivenessPublisher::new(
            Arc::clone(&self.store),
            self.session_id.clone(),
            self.config.heartbeat_interval,
            Arc::clone(&self.shutting_down),
        );
        match publisher.beat().await {
            Ok(Commit::Accepted(_)) => {}
            Ok(Commit::Rejected(rejection)) => {
                warn!(session = %self.session_id, %rejection, "initial heartbeat rejected")
            }
            Err(e) => warn!(session = %self.session_id, "initial heartbeat failed: {e}"),
        }

        let running = match self.start_components(publisher).await {
            Ok(running) => running,
            Err(e) => {
                error!(session = %self.session_id, "failed to start components: {e}");
                self.shutdown(TerminationReason::Error(e.to_string())).await;
                return Err(e);
            }
        };
        *self.running.lock() = Some(running);

        // A trigger may have fired while components were starting.
        if self.is_shutting_down() {
            if let Some(running) = self.running.lock().take() {
                stop(running);
            }
            return Ok(());
        }
        *self.phase.lock() = Phase::Active;
        Ok(())
    }

    async fn start_components(self: &Arc<Self>, publisher: LivenessPublisher) -> Result<Running> {
        let (pending_rows, pending) = self.store.subscribe(ViewQuery::PendingWork).await?.split();
        let (session_rows, sessions) = self
            .store
            .subscribe(ViewQuery::ActiveSessions)
            .await?
            .split();
        let (assigned_rows, assigned) = self
            .store
            .subscribe(ViewQuery::AssignedWork {
                session_id: self.session_id.clone(),
            })
            .await?
            .split();

        let coordinator = ClaimCoordinator::new(Arc::clone(&self.store), self.session_id.clone());
        let engine = ExecutionEngine::new(
            Arc::clone(&self.store),
            self.session_id.clone(),
            self.config.capabilities,
            Arc::clone(&self.computation),
            Arc::clone(&self.ledger),
        );

        self.supervise(
            "claim",
            tokio::spawn(coordinator.run(pending_rows, session_rows)),
        );
        self.supervise("execution", tokio::spawn(engine.run(assigned_rows)));

        Ok(Running {
            heartbeat: publisher.spawn(),
            subscriptions: vec![pending, assigned, sessions],
        })
    }

    /// Turn a component that dies on its own into a shutdown request.
    fn supervise(self: &Arc<Self>, component: &'static str, task: JoinHandle<Result<()>>) {
        let manager: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let outcome = task.await;
            let Some(manager) = manager.upgrade() else {
                return;
            };
            let reason = match outcome {
                Ok(Ok(())) if manager.is_shutting_down() => return,
                Ok(Ok(())) => format!("{component} subscription ended unexpectedly"),
                Ok(Err(e)) => format!("{component} failed: {e}"),
                Err(e) if e.is_panic() => format!("{component} panicked"),
                Err(_) => return,
            };
            error!(session = %manager.session_id, component, "{reason}");
            manager.request_shutdown(TerminationReason::Error(reason));
        });
    }

    /// Ask for a graceful shutdown. Only the first reason is kept.
    pub fn request_shutdown(&self, reason: TerminationReason) {
        self.requested.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    /// Wait until something requests shutdown, and return why.
    pub async fn shutdown_requested(&self) -> TerminationReason {
        let mut rx = self.requested.subscribe();
        rx.wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|reason| (*reason).clone())
            .unwrap_or(TerminationReason::Shutdown)
    }

    /// Block until a shutdown request arrives, then tear down.
    pub async fn run_until_shutdown(&self) -> TerminationReason {
        let reason = self.shutdown_requested().await;
        self.shutdown(reason.clone()).await;
        reason
    }

    /// Tear the session down. Returns `false` if teardown already ran.
    ///
    /// Stops the heartbeat, releases all subscriptions, commits
    /// `session-terminated`, and closes the store. An execution already
    /// in flight is not cancelled.
    pub async fn shutdown(&self, reason: TerminationReason) -> bool {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return false;
        }
        *self.phase.lock() = Phase::ShuttingDown;
        self.request_shutdown(reason.clone());
        info!(session = %self.session_id, %reason, "shutting down");

        let running = self.running.lock().take();
        if let Some(running) = running {
            stop(running);
        }

        if self.registered.load(Ordering::SeqCst) {
            let commit = self
                .store
                .commit(EventKind::SessionTerminated {
                    session_id: self.session_id.clone(),
                    reason,
                })
                .await;
            match commit {
                Ok(Commit::Accepted(_)) => info!(session = %self.session_id, "session terminated"),
                Ok(Commit::Rejected(rejection)) => {
                    warn!(session = %self.session_id, %rejection, "termination rejected")
                }
                Err(e) => warn!(session = %self.session_id, "termination commit failed: {e}"),
            }
        }

        if let Err(e) = self.store.close().await {
            warn!(session = %self.session_id, "closing store failed: {e}");
        }

        *self.phase.lock() = Phase::Terminated;
        true
    }
}

fn stop(running: Running) {
    running.heartbeat.abort();
    for subscription in running.subscriptions {
        subscription.unsubscribe();
    }
}
