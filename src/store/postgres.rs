//! Postgres-backed notebook log.
//!
//! One `kernel_events` table holds every notebook's log, keyed by
//! `(stream_id, seq)`. The primary key is the compare-and-append: a writer
//! appends at `head + 1` and loses cleanly if someone else got there
//! first. Commits `pg_notify` a channel; a `PgListener` task catches the
//! local projection up on notification, polling as a fallback.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgListener, PgPoolOptions};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::projection::SharedView;
use super::{Commit, Rows, Store, Subscription, ViewQuery};
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::telemetry::metrics;

const CHANNEL: &str = "kernel_events";
const MAX_APPEND_ATTEMPTS: usize = 5;
const POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct PgStore {
    pool: PgPool,
    notebook_id: String,
    view: Arc<SharedView>,
    /// Serializes catch-up reads so pages are applied in order.
    sync: tokio::sync::Mutex<()>,
    listener: parking_lot::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl PgStore {
    /// Connect to Postgres for one notebook. The auth token is the
    /// connection password.
    pub async fn connect(
        url: &str,
        auth_token: &SecretString,
        notebook_id: &str,
    ) -> Result<Arc<Self>> {
        let options = PgConnectOptions::from_str(url)?.password(auth_token.expose_secret());
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Arc::new(Self {
            pool,
            notebook_id: notebook_id.to_string(),
            view: SharedView::new(),
            sync: tokio::sync::Mutex::new(()),
            listener: parking_lot::Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }

    /// Create the event table if it does not exist.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kernel_events (
                stream_id    TEXT        NOT NULL,
                seq          BIGINT      NOT NULL,
                name         TEXT        NOT NULL,
                payload      JSONB       NOT NULL,
                committed_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (stream_id, seq)
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_kernel_events_name ON kernel_events (stream_id, name)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Run `SELECT 1` against the pool.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Start following the log. Subscriptions only see writes from other
    /// processes once this is running.
    pub async fn start_listener(self: &Arc<Self>) -> Result<()> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(CHANNEL).await?;
        self.catch_up().await?;

        let store: Weak<Self> = Arc::downgrade(self);
        let notebook_id = self.notebook_id.clone();
        let handle = tokio::spawn(async move {
            loop {
                let refresh = tokio::select! {
                    notif = listener.recv() => match notif {
                        Ok(n) => n.payload() == notebook_id,
                        Err(e) => {
                            warn!("PgListener error: {e}, falling back to poll");
                            tokio::time::sleep(POLL_INTERVAL).await;
                            true
                        }
                    },
                    _ = tokio::time::sleep(POLL_INTERVAL) => true,
                };
                let Some(store) = store.upgrade() else {
                    break;
                };
                if refresh {
                    if let Err(e) = store.catch_up().await {
                        warn!(notebook = %store.notebook_id, "catch-up failed: {e}");
                    }
                }
            }
        });

        info!(notebook = %self.notebook_id, "following notebook log");
        if let Some(previous) = self.listener.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// Apply every event past the local head.
    async fn catch_up(&self) -> Result<()> {
        let _guard = self.sync.lock().await;
        let head = self.view.head() as i64;

        let rows: Vec<EventRow> = sqlx::query_as(
            "SELECT seq, committed_at, payload FROM kernel_events
             WHERE stream_id = $1 AND seq > $2
             ORDER BY seq",
        )
        .bind(&self.notebook_id)
        .bind(head)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(());
        }
        let events = rows
            .into_iter()
            .map(EventRow::try_into_event)
            .collect::<Result<Vec<_>>>()?;
        debug!(
            notebook = %self.notebook_id,
            from = head,
            count = events.len(),
            "applied log page"
        );
        self.view.apply_all(&events);
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::StoreClosed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn query(&self, query: &ViewQuery) -> Result<Rows> {
        self.ensure_open()?;
        self.catch_up().await?;
        Ok(self.view.evaluate(query))
    }

    async fn subscribe(&self, query: ViewQuery) -> Result<Subscription> {
        self.ensure_open()?;
        self.catch_up().await?;
        Ok(self.view.subscribe(query))
    }

    async fn commit(&self, event: EventKind) -> Result<Commit> {
        self.ensure_open()?;
        let name = event.name();
        let payload = serde_json::to_value(&event)?;

        for attempt in 1..=MAX_APPEND_ATTEMPTS {
            self.catch_up().await?;
            let head = match self.view.check(&event) {
                Ok(head) => head,
                Err(rejection) => {
                    metrics::record_commit(name, false);
                    return Ok(Commit::Rejected(rejection));
                }
            };

            let seq = head as i64 + 1;
            let now = Utc::now();
            let mut tx = self.pool.begin().await?;
            let inserted: Option<(i64,)> = sqlx::query_as(
                "INSERT INTO kernel_events (stream_id, seq, name, payload, committed_at)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (stream_id, seq) DO NOTHING
                 RETURNING seq",
            )
            .bind(&self.notebook_id)
            .bind(seq)
            .bind(name)
            .bind(&payload)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?;

            if inserted.is_none() {
                tx.rollback().await?;
                debug!(event = name, attempt, seq, "log moved on, re-validating");
                continue;
            }

            // NOTIFY is transactional: it only fires on commit
            sqlx::query("SELECT pg_notify($1, $2)")
                .bind(CHANNEL)
                .bind(&self.notebook_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;

            self.catch_up().await?;
            metrics::record_commit(name, true);
            return Ok(Commit::Accepted(Event {
                seq: seq as u64,
                timestamp: now,
                kind: event,
            }));
        }

        Err(Error::Other(format!(
            "{name}: lost {MAX_APPEND_ATTEMPTS} append races in a row"
        )))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
        self.pool.close().await;
        info!(notebook = %self.notebook_id, "store connection closed");
        Ok(())
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct EventRow {
    seq: i64,
    committed_at: DateTime<Utc>,
    payload: serde_json::Value,
}

impl EventRow {
    fn try_into_event(self) -> Result<Event> {
        Ok(Event {
            seq: self.seq as u64,
            timestamp: self.committed_at,
            kind: serde_json::from_value(self.payload)?,
        })
    }
}
