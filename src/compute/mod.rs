//! Pluggable per-cell computation and the worker profile that selects it.
//!
//! The engine hands each resolved cell to a [`Computation`] and commits
//! whatever outputs come back. Which computation runs, and what the
//! session advertises about itself, comes from a TOML profile:
//!
//! ```toml
//! [worker]
//! kind = "python3"
//!
//! [worker.capabilities]
//! can_execute_code = true
//!
//! [computation]
//! kind = "command"
//! command = "hooks/python-exec"
//! ```

pub mod command;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::Instrument;

use crate::error::{Error, Result};
use crate::model::{Capabilities, Cell, OutputPayload};

pub use command::CommandComputation;

#[async_trait]
pub trait Computation: Send + Sync {
    /// Run the cell. Outputs are committed in the order returned.
    async fn execute(&self, cell: &Cell) -> Result<Vec<OutputPayload>>;
}

tokio::task_local! {
    static CONTAINED: ();
}

/// Run `computation` on its own task so that a panic fails only this cell.
///
/// A panic comes back as `Error::Execution`; the caller then records a
/// failure completion like for any other execution error.
pub async fn run_contained(
    computation: Arc<dyn Computation>,
    cell: Cell,
) -> Result<Vec<OutputPayload>> {
    let task = tokio::spawn(
        CONTAINED
            .scope((), async move { computation.execute(&cell).await })
            .in_current_span(),
    );
    match task.await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(Error::Execution(format!(
            "computation panicked: {}",
            panic_message(e.into_panic().as_ref())
        ))),
        Err(e) => Err(Error::Execution(format!("computation cancelled: {e}"))),
    }
}

/// Is the current task running a contained computation?
///
/// Process-wide panic hooks use this to leave contained panics to
/// [`run_contained`].
pub fn in_contained_computation() -> bool {
    CONTAINED.try_with(|_| ()).is_ok()
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Returns the cell source as its single result.
#[derive(Debug, Default, Clone, Copy)]
pub struct Echo;

#[async_trait]
impl Computation for Echo {
    async fn execute(&self, cell: &Cell) -> Result<Vec<OutputPayload>> {
        Ok(vec![OutputPayload::text(cell.source.clone())])
    }
}

// ---------------------------------------------------------------------------
// Profile
// ---------------------------------------------------------------------------

/// Top-level TOML wrapper.
#[derive(Debug, Default, Deserialize)]
struct ProfileFile {
    #[serde(default)]
    worker: WorkerSection,
    #[serde(default)]
    computation: ComputationConfig,
}

#[derive(Debug, Deserialize)]
struct WorkerSection {
    #[serde(default = "default_kind")]
    kind: String,
    #[serde(default)]
    capabilities: Capabilities,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            capabilities: Capabilities::default(),
        }
    }
}

fn default_kind() -> String {
    "echo".to_string()
}

/// Which computation a worker runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ComputationConfig {
    #[default]
    Echo,
    Command {
        command: std::path::PathBuf,
        #[serde(default)]
        args: Vec<String>,
    },
}

/// What a worker is and how it computes.
#[derive(Debug, Clone)]
pub struct WorkerProfile {
    pub kind: String,
    pub capabilities: Capabilities,
    pub computation: ComputationConfig,
}

impl Default for WorkerProfile {
    fn default() -> Self {
        ProfileFile::default().into()
    }
}

impl From<ProfileFile> for WorkerProfile {
    fn from(file: ProfileFile) -> Self {
        Self {
            kind: file.worker.kind,
            capabilities: file.worker.capabilities,
            computation: file.computation,
        }
    }
}

impl WorkerProfile {
    /// Parse a profile from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        let file: ProfileFile = toml::from_str(text)
            .map_err(|e| Error::Config(format!("bad worker profile: {e}")))?;
        Ok(file.into())
    }

    /// Load a profile file, or the built-in echo profile when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read worker profile {}: {e}", path.display()))
        })?;
        Self::from_toml(&text)
    }

    /// Build the configured computation.
    pub fn computation(&self) -> Arc<dyn Computation> {
        match self.computation {
            ComputationConfig::Echo => Arc::new(Echo),
            ComputationConfig::Command {
                ref command,
                ref args,
            } => Arc::new(CommandComputation::new(command.clone(), args.clone())),
        }
    }
}
