//! Launches workers as OS processes.
//!
//! Each worker runs in its own process group so that stopping it also stops
//! anything it spawned: SIGTERM to the group, a grace period, then SIGKILL.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use foreman_core::config::WorkerConfig;

use super::{
    Assignment, ENV_AGENT_CLASS, ENV_AGENT_ID, ENV_FEATURE_IDS, SubprocessError, WorkerHandle,
    WorkerLauncher,
};

/// Buffered stdout lines per worker.
const LINE_BUFFER: usize = 256;

/// How often a stopping process group is checked for survivors.
#[cfg(unix)]
const GROUP_POLL: Duration = Duration::from_millis(50);

/// [`WorkerLauncher`] backed by a configured executable.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    command: PathBuf,
    args: Vec<String>,
    working_directory: Option<PathBuf>,
    terminate_timeout: Duration,
}

impl ProcessLauncher {
    pub fn new(config: &WorkerConfig, terminate_timeout: Duration) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            working_directory: config.working_directory.clone(),
            terminate_timeout,
        }
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, assignment: &Assignment) -> Result<WorkerHandle, SubprocessError> {
        let descriptor =
            serde_json::to_string(&assignment.descriptor()).map_err(|e| {
                SubprocessError::SpawnFailed {
                    reason: format!("descriptor: {e}"),
                }
            })?;
        let feature_ids = assignment
            .feature_ids()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .env(ENV_AGENT_ID, &assignment.agent_id)
            .env(ENV_AGENT_CLASS, assignment.class.as_str())
            .env(ENV_FEATURE_IDS, &feature_ids)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_directory {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(|e| SubprocessError::SpawnFailed {
            reason: format!("{}: {e}", self.command.display()),
        })?;
        let pid = child.id();

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SubprocessError::SpawnFailed {
                reason: "stdout not captured".to_string(),
            })?;
        let agent_id = assignment.agent_id.clone();

        if let Some(stdin) = child.stdin.take() {
            tokio::spawn(write_descriptor(stdin, descriptor, agent_id.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_stderr(stderr, agent_id.clone()));
        }

        let (line_tx, line_rx) = mpsc::channel(LINE_BUFFER);
        tokio::spawn(read_lines(stdout, line_tx));

        let (term_tx, term_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(reap(
            child,
            term_rx,
            exit_tx,
            self.terminate_timeout,
            agent_id.clone(),
        ));

        info!(
            agent_id = %agent_id,
            pid = ?pid,
            class = %assignment.class,
            feature_ids = %feature_ids,
            "Worker spawned"
        );
        Ok(WorkerHandle::new(pid, line_rx, term_tx, exit_rx))
    }
}

async fn write_descriptor(mut stdin: ChildStdin, descriptor: String, agent_id: String) {
    let result = async {
        stdin.write_all(descriptor.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await
    }
    .await;
    if let Err(e) = result {
        warn!(agent_id, error = %e, "Failed to write batch descriptor");
    }
    // Dropping stdin closes it.
}

async fn read_lines<R: AsyncRead + Unpin>(stream: R, tx: mpsc::Sender<String>) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Worker stdout read error");
                break;
            }
        }
    }
}

pub(super) async fn log_stderr<R: AsyncRead + Unpin>(stream: R, agent_id: String) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            warn!(agent_id, stderr = %line, "Worker stderr");
        }
    }
}

enum Leader {
    Exited(Option<ExitStatus>),
    Stopped(Option<ExitStatus>),
}

/// Wait for the worker to exit on its own or, once asked (or once the
/// handle is dropped), stop it.
///
/// The exit is reported only after the whole process group is gone. A
/// leader that exits on its own may leave descendants behind; those are
/// stopped when termination is requested.
async fn reap(
    mut child: Child,
    mut terminate: oneshot::Receiver<()>,
    exited: oneshot::Sender<Option<i32>>,
    grace: Duration,
    agent_id: String,
) {
    let pid = child.id();
    let leader = tokio::select! {
        status = child.wait() => Leader::Exited(status.ok()),
        _ = &mut terminate => Leader::Stopped(terminate_process(&mut child, grace, &agent_id).await),
    };

    let status = match leader {
        Leader::Exited(status) => {
            debug!(agent_id, ?status, "Worker leader exited");
            let _ = terminate.await;
            #[cfg(unix)]
            {
                if let Some(pid) = pid {
                    stop_group(pid, Instant::now() + grace, &agent_id).await;
                }
            }
            #[cfg(not(unix))]
            {
                let _ = pid;
            }
            status
        }
        Leader::Stopped(status) => status,
    };

    let code = status.and_then(|s| s.code());
    debug!(agent_id, ?code, "Worker exited");
    let _ = exited.send(code);
}

/// SIGTERM the process group, wait `grace`, then SIGKILL whatever is left
/// of it.
pub(super) async fn terminate_process(
    child: &mut Child,
    grace: Duration,
    agent_id: &str,
) -> Option<ExitStatus> {
    let pid = child.id();
    let deadline = Instant::now() + grace;

    #[cfg(unix)]
    {
        if let Some(pid) = pid
            && let Err(e) = signal_group(pid, libc::SIGTERM)
        {
            debug!(agent_id, pid, error = %e, "Failed to send SIGTERM");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    let status = match tokio::time::timeout_at(deadline, child.wait()).await {
        Ok(Ok(status)) => {
            info!(agent_id, ?status, "Worker exited gracefully");
            Some(status)
        }
        Ok(Err(e)) => {
            warn!(agent_id, error = %e, "Error waiting for worker");
            kill_process(child, pid).await
        }
        Err(_) => {
            warn!(agent_id, "Timeout waiting for graceful shutdown, killing");
            kill_process(child, pid).await
        }
    };

    #[cfg(unix)]
    {
        if let Some(pid) = pid {
            stop_group(pid, deadline, agent_id).await;
        }
    }
    status
}

async fn kill_process(child: &mut Child, pid: Option<u32>) -> Option<ExitStatus> {
    #[cfg(unix)]
    {
        if let Some(pid) = pid {
            let _ = signal_group(pid, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }
    child.kill().await.ok();
    child.wait().await.ok()
}

/// Stop every process left in the group led by `pgid`: SIGTERM, poll until
/// `deadline`, then SIGKILL.
#[cfg(unix)]
async fn stop_group(pgid: u32, deadline: Instant, agent_id: &str) {
    if !group_alive(pgid) {
        return;
    }
    debug!(agent_id, pgid, "Stopping worker descendants");
    let _ = signal_group(pgid, libc::SIGTERM);
    while Instant::now() < deadline {
        tokio::time::sleep(GROUP_POLL).await;
        if !group_alive(pgid) {
            return;
        }
    }
    warn!(agent_id, pgid, "Worker descendants outlived the grace period, killing");
    let _ = signal_group(pgid, libc::SIGKILL);
}

#[cfg(unix)]
fn group_alive(pgid: u32) -> bool {
    signal_group(pgid, 0).is_ok()
}

/// Send `signal` to the process group led by `pid`.
#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
    let pgid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::other(format!("pid {pid} out of range")))?;
    // SAFETY: killpg(2) only delivers a signal; `pgid` is the group this
    // process created for the child via `process_group(0)`.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::killpg(pgid, signal) };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Instant;

    use foreman_core::{Feature, WorkerClass};

    use super::*;

    fn shell(script: &str) -> ProcessLauncher {
        ProcessLauncher::new(
            &WorkerConfig {
                command: PathBuf::from("/bin/sh"),
                args: vec!["-c".to_string(), script.to_string()],
                working_directory: None,
                intake_command: None,
            },
            Duration::from_millis(500),
        )
    }

    fn assignment() -> Assignment {
        Assignment {
            agent_id: "agent-7".to_string(),
            class: WorkerClass::Primary,
            slot: 0,
            features: vec![Feature::new(3, "a"), Feature::new(5, "b")],
        }
    }

    async fn collect(handle: &mut WorkerHandle) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(line) =
            tokio::time::timeout(Duration::from_secs(5), handle.lines.recv())
                .await
                .expect("worker output timed out")
        {
            out.push(line);
        }
        out
    }

    #[tokio::test]
    async fn worker_reads_descriptor_and_env() {
        let launcher =
            shell(r#"read -r batch; echo "$batch"; echo "$FOREMAN_AGENT_ID $FOREMAN_AGENT_CLASS $FOREMAN_FEATURE_IDS""#);
        let mut handle = launcher.launch(&assignment()).unwrap();

        let lines = collect(&mut handle).await;
        assert_eq!(lines.len(), 2);
        let batch: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(batch["agent_id"], "agent-7");
        assert_eq!(batch["features"][1]["id"], 5);
        assert_eq!(lines[1], "agent-7 primary 3,5");
        handle.terminate();
        assert_eq!(handle.wait_exit(Duration::from_secs(5)).await, Some(0));
    }

    #[tokio::test]
    async fn terminate_stops_worker_and_children() {
        let launcher = shell("sleep 30 & sleep 30; wait");
        let mut handle = launcher.launch(&assignment()).unwrap();

        let started = Instant::now();
        handle.terminate();
        handle.wait_exit(Duration::from_secs(5)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(handle.lines.recv().await.is_none());
    }

    /// Alive and not a zombie waiting to be reaped.
    fn running(pid: u32) -> bool {
        std::fs::read_to_string(format!("/proc/{pid}/stat")).is_ok_and(|stat| {
            stat.rsplit_once(')')
                .and_then(|(_, rest)| rest.split_whitespace().next())
                .is_some_and(|state| state != "Z")
        })
    }

    #[tokio::test]
    async fn terminate_stops_children_after_leader_exits() {
        let launcher = shell("sleep 30 >/dev/null 2>&1 & echo $!; exit 0");
        let mut handle = launcher.launch(&assignment()).unwrap();
        let orphan: u32 = handle.lines.recv().await.unwrap().parse().unwrap();
        assert!(handle.lines.recv().await.is_none());
        tokio::time::sleep(Duration::from_millis(300)).await;

        // The leader is gone but its child still holds the group.
        assert_eq!(handle.wait_exit(Duration::from_millis(100)).await, None);
        if cfg!(target_os = "linux") {
            assert!(running(orphan));
        }

        handle.terminate();
        assert_eq!(handle.wait_exit(Duration::from_secs(5)).await, Some(0));

        let pgid = libc::pid_t::try_from(handle.pid.unwrap()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        let group_gone = loop {
            // SAFETY: signal 0 only probes for existence.
            #[allow(unsafe_code)]
            let probe = unsafe { libc::killpg(pgid, 0) };
            let gone = probe != 0 || (cfg!(target_os = "linux") && !running(orphan));
            if gone || Instant::now() > deadline {
                break gone;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        };
        assert!(group_gone, "background child outlived terminate");
    }

    #[tokio::test]
    async fn dropping_handle_stops_worker() {
        let launcher = shell("echo started; sleep 30");
        let mut handle = launcher.launch(&assignment()).unwrap();
        assert_eq!(handle.lines.recv().await.as_deref(), Some("started"));
        let pid = handle.pid.unwrap();
        drop(handle);

        let deadline = Instant::now() + Duration::from_secs(5);
        let gone = loop {
            let status = std::process::Command::new("kill")
                .arg("-0")
                .arg(pid.to_string())
                .status()
                .unwrap();
            if !status.success() || Instant::now() > deadline {
                break !status.success();
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        };
        assert!(gone);
    }

    #[tokio::test]
    async fn missing_executable_is_a_spawn_error() {
        let launcher = ProcessLauncher::new(
            &WorkerConfig {
                command: PathBuf::from("/nonexistent/foreman-worker"),
                ..WorkerConfig::default()
            },
            Duration::from_millis(100),
        );
        assert!(matches!(
            launcher.launch(&assignment()),
            Err(SubprocessError::SpawnFailed { .. })
        ));
    }
}
