//! Process-local store.
//!
//! Same semantics as the Postgres log, minus durability. Keeps the full
//! event history so callers can inspect exactly what was committed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use super::projection::SharedView;
use super::{Commit, Rows, Store, Subscription, ViewQuery};
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::telemetry::metrics;

pub struct MemoryStore {
    view: Arc<SharedView>,
    history: Mutex<Vec<Event>>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            view: SharedView::new(),
            history: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Every accepted event, in log order.
    pub fn events(&self) -> Vec<Event> {
        self.history.lock().clone()
    }

    /// Accepted events with the given name, in log order.
    pub fn events_named(&self, name: &str) -> Vec<Event> {
        self.history
            .lock()
            .iter()
            .filter(|e| e.kind.name() == name)
            .cloned()
            .collect()
    }

    pub fn head(&self) -> u64 {
        self.view.head()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::StoreClosed)
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn query(&self, query: &ViewQuery) -> Result<Rows> {
        self.ensure_open()?;
        Ok(self.view.evaluate(query))
    }

    async fn subscribe(&self, query: ViewQuery) -> Result<Subscription> {
        self.ensure_open()?;
        Ok(self.view.subscribe(query))
    }

    async fn commit(&self, event: EventKind) -> Result<Commit> {
        self.ensure_open()?;
        // Held across the append so history order matches seq order.
        let name = event.name();
        let mut history = self.history.lock();
        match self.view.append(event, Utc::now()) {
            Ok(event) => {
                history.push(event.clone());
                metrics::record_commit(name, true);
                Ok(Commit::Accepted(event))
            }
            Err(rejection) => {
                metrics::record_commit(name, false);
                Ok(Commit::Rejected(rejection))
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
