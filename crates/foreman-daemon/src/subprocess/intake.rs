//! One-shot intake command that populates an empty backlog.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{info, warn};

use super::SubprocessError;
use super::worker::{log_stderr, terminate_process};

const INTAKE_LOG_ID: &str = "intake";

/// Run `command` (program followed by its arguments) to completion.
///
/// Stdout and stderr are logged. The process group is stopped if it outlives
/// `limit`.
pub async fn run_intake(
    command: &[String],
    working_directory: Option<&Path>,
    limit: Duration,
) -> Result<(), SubprocessError> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| SubprocessError::SpawnFailed {
            reason: "empty intake command".to_string(),
        })?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = working_directory {
        cmd.current_dir(dir);
    }
    #[cfg(unix)]
    {
        cmd.process_group(0);
    }

    let mut child = cmd.spawn().map_err(|e| SubprocessError::SpawnFailed {
        reason: format!("{program}: {e}"),
    })?;
    info!(program, pid = ?child.id(), "Intake started");

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(log_stdout(stdout));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(log_stderr(stderr, INTAKE_LOG_ID.to_string()));
    }

    if let Ok(status) = tokio::time::timeout(limit, child.wait()).await {
        let status = status?;
        if status.success() {
            info!("Intake finished");
            Ok(())
        } else {
            warn!(?status, "Intake failed");
            Err(SubprocessError::ExitStatus {
                code: status.code(),
            })
        }
    } else {
        warn!(secs = limit.as_secs(), "Intake timed out");
        terminate_process(&mut child, Duration::from_secs(5), INTAKE_LOG_ID).await;
        Err(SubprocessError::Timeout {
            secs: limit.as_secs(),
        })
    }
}

async fn log_stdout(stream: tokio::process::ChildStdout) {
    use tokio::io::{AsyncBufReadExt, BufReader};

    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(output = %line, "Intake output");
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn successful_intake() {
        let dir = tempfile::tempdir().unwrap();
        run_intake(&sh("touch populated"), Some(dir.path()), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(dir.path().join("populated").exists());
    }

    #[tokio::test]
    async fn failing_intake_reports_exit_code() {
        let err = run_intake(&sh("exit 3"), None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, SubprocessError::ExitStatus { code: Some(3) }));
    }

    #[tokio::test]
    async fn slow_intake_times_out() {
        let err = run_intake(&sh("sleep 30"), None, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, SubprocessError::Timeout { .. }));
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        assert!(matches!(
            run_intake(&[], None, Duration::from_secs(1)).await,
            Err(SubprocessError::SpawnFailed { .. })
        ));
    }
}
