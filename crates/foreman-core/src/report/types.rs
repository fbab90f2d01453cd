//! Worker lifecycle and report types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;
use crate::feature::FeatureId;

/// Worker class: primary workers build new features, verification workers
/// re-check features that already pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerClass {
    Primary,
    Verification,
}

impl WorkerClass {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Verification => "verification",
        }
    }
}

impl fmt::Display for WorkerClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary" => Ok(Self::Primary),
            "verification" => Ok(Self::Verification),
            other => Err(Error::ReportParse(format!("unknown worker class: {other}"))),
        }
    }
}

/// Lifecycle state declared by a worker.
///
/// `idle → thinking → working ⇄ testing → {success | error}`, with
/// `struggling` reachable from `working`/`testing`. Anything else a worker
/// prints lands in [`AgentState::Unknown`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum AgentState {
    #[default]
    Idle,
    Thinking,
    Working,
    Testing,
    Struggling,
    Success,
    Error,
    Unknown(String),
}

impl AgentState {
    /// Map a free-form status string onto the closed state set.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "idle" => Self::Idle,
            "thinking" => Self::Thinking,
            "working" => Self::Working,
            "testing" => Self::Testing,
            "struggling" => Self::Struggling,
            "success" => Self::Success,
            "error" => Self::Error,
            _ => Self::Unknown(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Idle => "idle",
            Self::Thinking => "thinking",
            Self::Working => "working",
            Self::Testing => "testing",
            Self::Struggling => "struggling",
            Self::Success => "success",
            Self::Error => "error",
            Self::Unknown(raw) => raw,
        }
    }

    /// `success` and `error` end a batch.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }

    /// Whether `next` follows `self` in the lifecycle graph.
    ///
    /// Only used for diagnostics: the supervisor records whatever the worker
    /// declares, an unexpected edge is logged and nothing else.
    pub fn expects(&self, next: &Self) -> bool {
        use AgentState::{Idle, Struggling, Testing, Thinking, Working};

        if self.is_terminal() {
            return false;
        }
        if self == next || next.is_terminal() {
            return true;
        }
        matches!(
            (self, next),
            (Idle, Thinking | Working)
                | (Thinking, Working)
                | (Working, Testing | Struggling | Thinking)
                | (Testing, Working | Struggling)
                | (Struggling, Working | Testing)
        )
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for AgentState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for AgentState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

/// Per-feature outcome carried by a terminal report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureResult {
    pub id: FeatureId,
    pub passes: bool,
}

/// One parsed line of worker output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub state: AgentState,
    pub note: Option<String>,
    /// Worker-side timestamp (unix seconds), if it sent one.
    pub timestamp: Option<i64>,
    /// Explicit per-feature outcomes. `None` when the worker did not report
    /// any, which is different from an empty list.
    pub results: Option<Vec<FeatureResult>>,
}

impl WorkerReport {
    pub const fn new(state: AgentState) -> Self {
        Self {
            state,
            note: None,
            timestamp: None,
            results: None,
        }
    }

    #[must_use]
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    #[must_use]
    pub fn with_results(mut self, results: Vec<FeatureResult>) -> Self {
        self.results = Some(results);
        self
    }

    pub const fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
