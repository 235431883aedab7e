//! Integration tests for computations and worker profiles.

use std::path::PathBuf;

use kernel_worker::compute::{Computation, ComputationConfig, Echo, WorkerProfile};
use kernel_worker::model::*;

fn cell(source: &str) -> Cell {
    Cell {
        id: "c1".into(),
        cell_type: CellType::Code,
        source: source.to_string(),
    }
}

#[tokio::test]
async fn echo_returns_source_as_single_result() {
    let outputs = Echo.execute(&cell("print(1)")).await.unwrap();
    assert_eq!(outputs, vec![OutputPayload::text("print(1)")]);
    assert_eq!(outputs[0].kind(), OutputKind::Result);
}

#[test]
fn default_profile_is_echo_for_code() {
    let profile = WorkerProfile::default();
    assert_eq!(profile.kind, "echo");
    assert_eq!(profile.computation, ComputationConfig::Echo);
    assert!(profile.capabilities.supports(CellType::Code));
    assert!(!profile.capabilities.supports(CellType::Sql));
    assert!(!profile.capabilities.supports(CellType::Markdown));
}

#[test]
fn profile_parses_worker_and_command() {
    let profile = WorkerProfile::from_toml(
        r#"
        [worker]
        kind = "python3"

        [worker.capabilities]
        can_execute_code = true
        can_execute_sql = true

        [computation]
        kind = "command"
        command = "/usr/bin/python3"
        args = ["-u", "-"]
        "#,
    )
    .unwrap();

    assert_eq!(profile.kind, "python3");
    assert!(profile.capabilities.can_execute_sql);
    assert!(!profile.capabilities.can_execute_ai);
    assert_eq!(
        profile.computation,
        ComputationConfig::Command {
            command: PathBuf::from("/usr/bin/python3"),
            args: vec!["-u".to_string(), "-".to_string()],
        }
    );
}

#[test]
fn empty_profile_uses_defaults() {
    let profile = WorkerProfile::from_toml("").unwrap();
    assert_eq!(profile.kind, "echo");
    assert_eq!(profile.computation, ComputationConfig::Echo);
}

#[test]
fn malformed_profile_is_a_config_error() {
    let err = WorkerProfile::from_toml("[computation]\nkind = \"teleport\"").unwrap_err();
    assert!(matches!(err, kernel_worker::error::Error::Config(_)));
}

#[test]
fn profile_loads_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("worker.toml");
    std::fs::write(&path, "[worker]\nkind = \"custom\"\n").unwrap();

    let profile = WorkerProfile::load(Some(path.as_path())).unwrap();
    assert_eq!(profile.kind, "custom");
    assert!(WorkerProfile::load(Some(dir.path().join("missing.toml").as_path())).is_err());
    assert_eq!(WorkerProfile::load(None).unwrap().kind, "echo");
}

#[cfg(unix)]
mod command {
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    use kernel_worker::compute::{CommandComputation, Computation};
    use kernel_worker::model::*;

    use super::cell;

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("run.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn command_streams_stdout_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "cat; echo \" $KERNEL_CELL_ID\"; echo warn >&2");

        let outputs = CommandComputation::new(path, Vec::new())
            .execute(&cell("hello"))
            .await
            .unwrap();

        assert_eq!(
            outputs,
            vec![
                OutputPayload::Stream {
                    name: StreamName::Stdout,
                    text: "hello c1\n".to_string(),
                },
                OutputPayload::Stream {
                    name: StreamName::Stderr,
                    text: "warn\n".to_string(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn large_source_through_cat_does_not_deadlock() {
        let source = "x".repeat(1 << 20);
        let outputs = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            CommandComputation::new(PathBuf::from("/bin/cat"), Vec::new()).execute(&cell(&source)),
        )
        .await
        .expect("command should finish")
        .unwrap();

        assert_eq!(
            outputs,
            vec![OutputPayload::Stream {
                name: StreamName::Stdout,
                text: source,
            }]
        );
    }

    #[tokio::test]
    async fn command_that_ignores_stdin_uses_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "echo done");

        let outputs = CommandComputation::new(path, Vec::new())
            .execute(&cell(&"y".repeat(1 << 20)))
            .await
            .unwrap();
        assert_eq!(
            outputs,
            vec![OutputPayload::Stream {
                name: StreamName::Stdout,
                text: "done\n".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn silent_command_has_no_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "cat >/dev/null");
        let outputs = CommandComputation::new(path, Vec::new())
            .execute(&cell("ignored"))
            .await
            .unwrap();
        assert!(outputs.is_empty());
    }

    #[tokio::test]
    async fn nonzero_exit_fails_with_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "cat >/dev/null; echo 'NameError: x' >&2; exit 3");

        let err = CommandComputation::new(path, Vec::new())
            .execute(&cell("x"))
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("status 3"));
        assert!(message.contains("NameError: x"));
    }
}
