//! Run cells through an external executable.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::Computation;
use crate::error::{Error, Result};
use crate::model::{Cell, OutputPayload, StreamName};

/// Pipes the cell source to a command's stdin.
///
/// Non-empty stdout and stderr become stream outputs, in that order. A
/// non-zero exit fails the execution.
#[derive(Debug, Clone)]
pub struct CommandComputation {
    command: PathBuf,
    args: Vec<String>,
}

impl CommandComputation {
    pub fn new(command: PathBuf, args: Vec<String>) -> Self {
        Self { command, args }
    }
}

#[async_trait]
impl Computation for CommandComputation {
    async fn execute(&self, cell: &Cell) -> Result<Vec<OutputPayload>> {
        // Resolve relative command paths against the process CWD, not
        // whatever directory the command later changes into.
        let command = if self.command.is_relative() {
            std::env::current_dir()?.join(&self.command)
        } else {
            self.command.clone()
        };

        let start = Instant::now();
        let mut child = Command::new(&command)
            .args(&self.args)
            .env("KERNEL_CELL_ID", cell.id.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Feed stdin while draining stdout and stderr; a child that echoes
        // its input would otherwise fill the pipe and deadlock.
        let stdin = child.stdin.take();
        let source = cell.source.clone().into_bytes();
        let feed = async move {
            match stdin {
                Some(mut stdin) => stdin.write_all(&source).await,
                None => Ok(()),
            }
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output?;
        match fed {
            Ok(()) => {}
            // The child exited without reading everything; its exit status decides.
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                debug!(cell = %cell.id, "command closed stdin early");
            }
            Err(e) => return Err(e.into()),
        }

        debug!(
            cell = %cell.id,
            command = %command.display(),
            status = ?output.status.code(),
            duration_ms = start.elapsed().as_millis() as u64,
            "command finished"
        );

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr.trim();
            return Err(Error::Execution(if detail.is_empty() {
                format!(
                    "command exited with status {}",
                    output.status.code().unwrap_or(-1)
                )
            } else {
                format!(
                    "command exited with status {}: {detail}",
                    output.status.code().unwrap_or(-1)
                )
            }));
        }

        let mut outputs = Vec::new();
        for (name, bytes) in [
            (StreamName::Stdout, &output.stdout),
            (StreamName::Stderr, &output.stderr),
        ] {
            if !bytes.is_empty() {
                outputs.push(OutputPayload::Stream {
                    name,
                    text: String::from_utf8_lossy(bytes).into_owned(),
                });
            }
        }
        Ok(outputs)
    }
}
