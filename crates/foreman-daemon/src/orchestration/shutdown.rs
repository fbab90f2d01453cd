//! Run control: start, soft-stop, hard-stop, pause and resume.
//!
//! Soft-stop stops new claims and lets running workers finish; the status
//! moves from `finishing` to `stopped` once the last one is gone. Hard-stop
//! terminates every worker and releases their batches. Pause is a soft-stop
//! that never finalizes.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::orchestrator::Orchestrator;
use super::state::{LoopState, RunStatus};

/// Extra time granted on top of the terminate grace period before a
/// hard-stop gives up waiting.
const HARD_STOP_MARGIN: Duration = Duration::from_secs(2);

/// Operator command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControlAction {
    Start,
    #[serde(alias = "soft_stop")]
    SoftStop,
    #[serde(alias = "hard_stop")]
    HardStop,
    Pause,
    Resume,
}

impl ControlAction {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::SoftStop => "soft-stop",
            Self::HardStop => "hard-stop",
            Self::Pause => "pause",
            Self::Resume => "resume",
        }
    }
}

impl fmt::Display for ControlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognised control action name.
#[derive(Debug, thiserror::Error)]
#[error("Unknown control action: {0}")]
pub struct UnknownAction(pub String);

impl FromStr for ControlAction {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "soft-stop" | "soft_stop" => Ok(Self::SoftStop),
            "hard-stop" | "hard_stop" => Ok(Self::HardStop),
            "pause" => Ok(Self::Pause),
            "resume" => Ok(Self::Resume),
            other => Err(UnknownAction(other.to_string())),
        }
    }
}

impl Orchestrator {
    /// Apply `action` and return the resulting status.
    pub async fn apply(&self, action: ControlAction) -> RunStatus {
        info!(%action, "Control action");
        match action {
            ControlAction::Start => self.start().await,
            ControlAction::SoftStop => self.soft_stop().await,
            ControlAction::HardStop => self.hard_stop().await,
            ControlAction::Pause => self.pause().await,
            ControlAction::Resume => self.resume().await,
        }
    }

    /// Begin (or restart) scheduling.
    pub async fn start(&self) -> RunStatus {
        let mut run = self.inner.run.lock().await;
        if run.status != RunStatus::Running {
            self.set_status(&mut run, RunStatus::Running);
            self.set_loop_state(&mut run, LoopState::Idle);
            self.wake();
        }
        run.status
    }

    /// Stop claiming and drain. A no-op when already finishing or stopped.
    pub async fn soft_stop(&self) -> RunStatus {
        let mut run = self.inner.run.lock().await;
        if matches!(run.status, RunStatus::Finishing | RunStatus::Stopped) {
            return run.status;
        }
        self.set_status(&mut run, RunStatus::Finishing);
        self.drain_step(&mut run);
        run.status
    }

    /// Terminate every worker now. Their batches go back to pending.
    pub async fn hard_stop(&self) -> RunStatus {
        {
            let mut run = self.inner.run.lock().await;
            self.set_status(&mut run, RunStatus::Stopped);
            self.set_loop_state(&mut run, LoopState::Stopped);
        }

        let supervisor = &self.inner.supervisor;
        let aborted = supervisor.abort_all().await;
        let limit = self.inner.config.terminate_timeout() * 2 + HARD_STOP_MARGIN;
        if supervisor.wait_idle(limit).await {
            info!(aborted, "Hard stop complete");
        } else {
            warn!(
                aborted,
                remaining = supervisor.active_total(),
                "Hard stop timed out waiting for workers"
            );
        }

        let mut run = self.inner.run.lock().await;
        run.counts.active_primary = 0;
        run.counts.active_verification = 0;
        self.set_loop_state(&mut run, LoopState::Stopped);
        run.status
    }

    /// Stop claiming without ever finalizing to stopped.
    pub async fn pause(&self) -> RunStatus {
        let mut run = self.inner.run.lock().await;
        if matches!(run.status, RunStatus::Running | RunStatus::Crashed) {
            self.set_status(&mut run, RunStatus::Paused);
        }
        run.status
    }

    /// Leave pause.
    pub async fn resume(&self) -> RunStatus {
        let mut run = self.inner.run.lock().await;
        if run.status == RunStatus::Paused {
            self.set_status(&mut run, RunStatus::Running);
            self.wake();
        }
        run.status
    }
}
