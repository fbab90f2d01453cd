//! Orchestrator state machines.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Where the scheduling loop currently is.
///
/// ```text
/// idle → initializing → scheduling → spawning → monitoring ─┐
///                           ↑                               │
///                           └───────── slot freed / tick ───┘
/// monitoring → complete | stalled | finishing → stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    #[default]
    Idle,
    Initializing,
    Scheduling,
    Spawning,
    Monitoring,
    Complete,
    Stalled,
    Finishing,
    Stopped,
}

impl LoopState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Initializing => "initializing",
            Self::Scheduling => "scheduling",
            Self::Spawning => "spawning",
            Self::Monitoring => "monitoring",
            Self::Complete => "complete",
            Self::Stalled => "stalled",
            Self::Finishing => "finishing",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Orchestrator-wide run status reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    /// Soft-stop requested; draining in-flight workers.
    Finishing,
    #[default]
    Stopped,
    /// The last tick failed against the feature store. Cleared by the next
    /// successful tick.
    Crashed,
    /// Like finishing, but never finalizes to stopped on its own.
    Paused,
}

impl RunStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Finishing => "finishing",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
            Self::Paused => "paused",
        }
    }

    /// Whether new batches may be claimed.
    pub const fn schedules(&self) -> bool {
        matches!(self, Self::Running | Self::Crashed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
