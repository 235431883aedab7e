//! kernel-worker CLI: run a worker, submit cells, inspect a notebook log.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use kernel_worker::compute::{WorkerProfile, in_contained_computation};
use kernel_worker::config::secrets::redacted;
use kernel_worker::config::{Config, Overrides};
use kernel_worker::engine::{SessionConfig, SessionManager};
use kernel_worker::model::{Cell, CellId, CellType, State, TerminationReason};
use kernel_worker::store::{self, ViewQuery};
use kernel_worker::telemetry::{TelemetryConfig, init_telemetry};
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "kernel-worker",
    about = "Claims and executes notebook cells from an event-sourced log"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// Where the notebook log lives and how to authenticate to it.
#[derive(Args)]
struct NotebookArgs {
    /// Notebook id (falls back to NOTEBOOK_ID)
    #[arg(long)]
    notebook: Option<String>,
    /// Auth token (falls back to AUTH_TOKEN)
    #[arg(long)]
    auth_token: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the worker until interrupted
    Run {
        #[command(flatten)]
        notebook: NotebookArgs,
        /// Stable runtime identity (falls back to RUNTIME_ID)
        #[arg(long)]
        runtime_id: Option<String>,
        /// Heartbeat period in seconds (falls back to HEARTBEAT_INTERVAL_SECS)
        #[arg(long)]
        heartbeat_secs: Option<u64>,
        /// Worker profile TOML (falls back to WORKER_PROFILE)
        #[arg(long)]
        profile: Option<PathBuf>,
    },
    /// Upsert a cell and request its execution
    Submit {
        #[command(flatten)]
        notebook: NotebookArgs,
        /// Cell source
        source: String,
        /// Reuse an existing cell id instead of creating a new cell
        #[arg(long)]
        cell_id: Option<String>,
        #[arg(long, value_enum, default_value_t = CellTypeArg::Code)]
        cell_type: CellTypeArg,
        /// Priority (higher = sooner)
        #[arg(long, default_value_t = 0)]
        priority: i32,
        /// Recorded as the requester
        #[arg(long)]
        requested_by: Option<String>,
    },
    /// Show sessions and work items
    Status {
        #[command(flatten)]
        notebook: NotebookArgs,
        /// Filter work by state
        #[arg(long)]
        state: Option<String>,
        /// Maximum work items to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum CellTypeArg {
    Code,
    Markdown,
    Sql,
    Ai,
}

impl From<CellTypeArg> for CellType {
    fn from(arg: CellTypeArg) -> Self {
        match arg {
            CellTypeArg::Code => CellType::Code,
            CellTypeArg::Markdown => CellType::Markdown,
            CellTypeArg::Sql => CellType::Sql,
            CellTypeArg::Ai => CellType::Ai,
        }
    }
}

impl NotebookArgs {
    fn overrides(self) -> Overrides {
        Overrides {
            notebook_id: self.notebook,
            auth_token: self.auth_token,
            ..Overrides::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            notebook,
            runtime_id,
            heartbeat_secs,
            profile,
        } => {
            let overrides = Overrides {
                runtime_id,
                heartbeat_secs,
                profile_path: profile,
                ..notebook.overrides()
            };
            cmd_run(overrides).await
        }
        Command::Submit {
            notebook,
            source,
            cell_id,
            cell_type,
            priority,
            requested_by,
        } => {
            let cell = Cell {
                id: cell_id.map(CellId::from).unwrap_or_else(CellId::generate),
                cell_type: cell_type.into(),
                source,
            };
            cmd_submit(notebook.overrides(), cell, priority, requested_by).await
        }
        Command::Status {
            notebook,
            state,
            limit,
        } => cmd_status(notebook.overrides(), state, limit).await,
    }
}

async fn cmd_run(overrides: Overrides) -> anyhow::Result<()> {
    let config = Config::load(overrides)?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "kernel-worker".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let profile = WorkerProfile::load(config.profile_path.as_deref())?;
    info!(
        notebook = %config.notebook_id,
        runtime = %config.runtime_id,
        kind = %profile.kind,
        auth = %redacted(&config.auth_token),
        "starting kernel worker"
    );

    let store = store::connect(&config).await?;
    let manager = SessionManager::new(
        store,
        SessionConfig::new(&config.runtime_id, &profile, config.heartbeat_interval),
        profile.computation(),
    );

    install_panic_hook(&manager);
    spawn_signal_listener(&manager);

    manager.start().await?;
    info!(session = %manager.session_id(), "worker active");

    let reason = manager.run_until_shutdown().await;
    info!(%reason, "kernel worker stopped");
    Ok(())
}

/// Panics outside a contained computation request a graceful shutdown
/// instead of orphaning work. A computation panic only fails its cell.
fn install_panic_hook(manager: &Arc<SessionManager>) {
    let manager = Arc::downgrade(manager);
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        previous(info);
        if in_contained_computation() {
            return;
        }
        if let Some(manager) = manager.upgrade() {
            manager.request_shutdown(TerminationReason::Error(format!("panic: {info}")));
        }
    }));
}

fn spawn_signal_listener(manager: &Arc<SessionManager>) {
    let manager = Arc::clone(manager);
    tokio::spawn(async move {
        let signal = wait_for_signal().await;
        info!(signal, "received signal");
        manager.request_shutdown(TerminationReason::Signal(signal.to_string()));
    });
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!("cannot listen for SIGTERM: {e}");
            tokio::signal::ctrl_c().await.ok();
            return "SIGINT";
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = term.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    tokio::signal::ctrl_c().await.ok();
    "ctrl-c"
}

async fn cmd_submit(
    overrides: Overrides,
    cell: Cell,
    priority: i32,
    requested_by: Option<String>,
) -> anyhow::Result<()> {
    let config = Config::load(overrides)?;
    if config.database_url.is_none() {
        anyhow::bail!("submit needs DATABASE_URL; an in-memory log ends with this process");
    }

    let store = store::connect(&config).await?;
    let cell_id = cell.id.clone();
    let work_id = store::submit_cell(store.as_ref(), cell, priority, requested_by).await?;
    println!("Requested: {work_id} (cell {cell_id}, priority {priority})");
    store.close().await?;
    Ok(())
}

async fn cmd_status(
    overrides: Overrides,
    state: Option<String>,
    limit: usize,
) -> anyhow::Result<()> {
    let config = Config::load(overrides)?;
    let state_filter: Option<State> = match state {
        Some(s) => Some(
            s.parse()
                .map_err(|_| anyhow::anyhow!("invalid state: {s}"))?,
        ),
        None => None,
    };

    let store = store::connect(&config).await?;
    let sessions = store.query(&ViewQuery::AllSessions).await?.into_sessions()?;
    let work = store.query(&ViewQuery::AllWork).await?.into_work()?;
    store.close().await?;

    let now = Utc::now();
    let stale_after = config.heartbeat_interval * 3;
    println!(
        "{:<44}  {:<10}  {:<10}  {:<4}  LAST HEARTBEAT",
        "SESSION", "KIND", "STATUS", "LIVE"
    );
    println!("{}", "-".repeat(100));
    for session in &sessions {
        println!(
            "{:<44}  {:<10}  {:<10}  {:<4}  {}",
            session.id.as_str(),
            session.kind,
            session.status.to_string(),
            if session.is_live(now, stale_after) { "yes" } else { "no" },
            session.last_heartbeat.format("%Y-%m-%d %H:%M:%S")
        );
    }

    let items: Vec<_> = work
        .iter()
        .filter(|w| state_filter.is_none_or(|s| w.state == s))
        .rev()
        .take(limit)
        .collect();

    println!();
    if items.is_empty() {
        println!("No work items found.");
        return Ok(());
    }
    println!(
        "{:<42}  {:<20}  {:<10}  {:<4}  {:<8}  SESSION",
        "WORK", "CELL", "STATE", "PRI", "MS"
    );
    println!("{}", "-".repeat(120));
    for item in &items {
        println!(
            "{:<42}  {:<20}  {:<10}  {:<4}  {:<8}  {}",
            item.id.as_str(),
            item.cell_id.as_str(),
            item.state.to_string(),
            item.priority,
            item.duration_ms
                .map(|ms| ms.to_string())
                .unwrap_or_else(|| "-".to_string()),
            item.assigned_session
                .as_ref()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
        if let Some(ref error) = item.error {
            println!("    error: {error}");
        }
    }
    println!("\n{} item(s)", items.len());
    Ok(())
}
