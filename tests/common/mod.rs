//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use kernel_worker::compute::Computation;
use kernel_worker::error::{Error, Result};
use kernel_worker::event::EventKind;
use kernel_worker::model::*;
use kernel_worker::store::{
    Commit, MemoryStore, Rejection, Rows, Store, Subscription, ViewQuery,
};
use parking_lot::Mutex;

pub fn memory_store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new())
}

pub async fn upsert_cell(store: &dyn Store, cell_id: &str, source: &str) {
    store
        .commit(EventKind::CellUpserted {
            cell_id: cell_id.into(),
            cell_type: CellType::Code,
            source: source.to_string(),
        })
        .await
        .unwrap()
        .accepted()
        .unwrap();
}

pub async fn request(store: &dyn Store, work_id: &str, cell_id: &str, priority: i32) {
    store
        .commit(EventKind::ExecutionRequested {
            work_id: work_id.into(),
            cell_id: cell_id.into(),
            priority,
            requested_by: Some("test".to_string()),
        })
        .await
        .unwrap()
        .accepted()
        .unwrap();
}

pub async fn register(store: &dyn Store, session_id: &str) {
    store
        .commit(EventKind::SessionStarted {
            session_id: session_id.into(),
            runtime_id: "test-runtime".to_string(),
            kind: "echo".to_string(),
            capabilities: Capabilities::default(),
        })
        .await
        .unwrap()
        .accepted()
        .unwrap();
}

pub async fn pending(store: &dyn Store) -> Vec<WorkItem> {
    store
        .query(&ViewQuery::PendingWork)
        .await
        .unwrap()
        .into_work()
        .unwrap()
}

pub async fn active(store: &dyn Store) -> Vec<WorkerSession> {
    store
        .query(&ViewQuery::ActiveSessions)
        .await
        .unwrap()
        .into_sessions()
        .unwrap()
}

pub async fn assigned(store: &dyn Store, session_id: &str) -> Vec<WorkItem> {
    store
        .query(&ViewQuery::AssignedWork {
            session_id: session_id.into(),
        })
        .await
        .unwrap()
        .into_work()
        .unwrap()
}

pub async fn work_item(store: &dyn Store, work_id: &str) -> WorkItem {
    store
        .query(&ViewQuery::AllWork)
        .await
        .unwrap()
        .into_work()
        .unwrap()
        .into_iter()
        .find(|w| w.id.as_str() == work_id)
        .expect("work item exists")
}

pub async fn outputs(store: &dyn Store, cell_id: &str) -> Vec<ExecutionOutput> {
    store
        .query(&ViewQuery::CellOutputs {
            cell_id: cell_id.into(),
        })
        .await
        .unwrap()
        .into_outputs()
        .unwrap()
}

/// Poll `check` every 10ms until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Counts invocations and returns a fixed list of outputs.
pub struct Scripted {
    pub calls: AtomicUsize,
    outputs: Vec<OutputPayload>,
    fail_with: Option<String>,
}

impl Scripted {
    pub fn returning(outputs: Vec<OutputPayload>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            outputs,
            fail_with: None,
        })
    }

    pub fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            outputs: Vec::new(),
            fail_with: Some(message.to_string()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Computation for Scripted {
    async fn execute(&self, _cell: &Cell) -> Result<Vec<OutputPayload>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // Yield so concurrent callers interleave.
        tokio::task::yield_now().await;
        match self.fail_with {
            Some(ref message) => Err(Error::Execution(message.clone())),
            None => Ok(self.outputs.clone()),
        }
    }
}

/// Panics on every cell.
pub struct Panicking;

#[async_trait]
impl Computation for Panicking {
    async fn execute(&self, _cell: &Cell) -> Result<Vec<OutputPayload>> {
        panic!("computation blew up");
    }
}

// ---------------------------------------------------------------------------
// Fault injection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The log refuses the append.
    Reject,
    /// The commit call itself fails.
    Fail,
}

/// Wraps a [`MemoryStore`], failing queued commits by event name.
pub struct FaultyStore {
    pub inner: Arc<MemoryStore>,
    faults: Mutex<HashMap<&'static str, VecDeque<Fault>>>,
    attempts: Mutex<HashMap<&'static str, usize>>,
}

impl FaultyStore {
    pub fn wrap(inner: Arc<MemoryStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            faults: Mutex::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
        })
    }

    /// Apply `faults` in order to the next commits of `event`.
    pub fn inject(&self, event: &'static str, faults: &[Fault]) {
        self.faults
            .lock()
            .entry(event)
            .or_default()
            .extend(faults.iter().copied());
    }

    pub fn attempts(&self, event: &str) -> usize {
        self.attempts.lock().get(event).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Store for FaultyStore {
    async fn query(&self, query: &ViewQuery) -> Result<Rows> {
        self.inner.query(query).await
    }

    async fn subscribe(&self, query: ViewQuery) -> Result<Subscription> {
        self.inner.subscribe(query).await
    }

    async fn commit(&self, event: EventKind) -> Result<Commit> {
        let name = event.name();
        let fault = {
            *self.attempts.lock().entry(name).or_default() += 1;
            self.faults
                .lock()
                .get_mut(name)
                .and_then(|queue| queue.pop_front())
        };
        match fault {
            Some(Fault::Reject) => Ok(Commit::Rejected(Rejection::InactiveSession(
                "injected".into(),
            ))),
            Some(Fault::Fail) => Err(Error::Other(format!("injected failure on {name}"))),
            None => self.inner.commit(event).await,
        }
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
