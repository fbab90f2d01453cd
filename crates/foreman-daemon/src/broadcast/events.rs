//! Observer protocol: events pushed to observers and messages they send.
//!
//! Every frame is a JSON object tagged by `type`. Broadcast frames carry a
//! monotonically increasing `seq`; frames addressed to a single observer
//! (`connected`, `snapshot`, `resync`, `ping`, `pong`, `error`) carry none.

use serde::{Deserialize, Serialize};

use foreman_core::db::unix_timestamp;
use foreman_core::{AgentState, FeatureId, FeatureStats, WorkerClass};

use crate::orchestration::readiness::PartitionIds;
use crate::orchestration::shutdown::ControlAction;
use crate::orchestration::state::{LoopState, RunStatus};

/// Backlog progress counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Progress {
    pub passing: u64,
    pub in_progress: u64,
    pub total: u64,
    pub percentage: f64,
}

impl From<FeatureStats> for Progress {
    fn from(stats: FeatureStats) -> Self {
        Self {
            passing: stats.passing,
            in_progress: stats.in_progress,
            total: stats.total,
            percentage: stats.percentage(),
        }
    }
}

/// How a terminated batch left one of its features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureOutcome {
    Passed,
    Failed,
    /// Back to pending with `passes` untouched.
    Released,
}

/// Why a worker was reclaimed without a terminal report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrashReason {
    /// No report within the stale window.
    Stale,
    /// The process exited before reporting `success` or `error`.
    Exited,
}

/// Supervisor view of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentView {
    pub agent_id: String,
    pub slot: usize,
    pub class: WorkerClass,
    pub feature_ids: Vec<FeatureId>,
    pub state: AgentState,
    pub note: Option<String>,
    pub started_at: i64,
    pub last_heartbeat: i64,
    /// Set on the last update for this worker; its slot is free.
    pub finished: bool,
}

/// Compact entry of the recent-event tail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecentEvent {
    pub seq: u64,
    pub timestamp: i64,
    pub summary: String,
}

/// Slot and readiness counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub active_primary: usize,
    pub active_verification: usize,
    pub max_primary: usize,
    pub max_verification: usize,
    pub ready: usize,
    pub blocked: usize,
    pub claimed: usize,
    pub done: usize,
}

/// Payload of `orchestrator_update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrchestratorSummary {
    pub loop_state: LoopState,
    pub status: RunStatus,
    #[serde(flatten)]
    pub counts: Counts,
    pub recent: Vec<RecentEvent>,
}

/// Full state an observer needs to render without history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub status: RunStatus,
    pub loop_state: LoopState,
    pub progress: Progress,
    pub counts: Counts,
    pub features: PartitionIds,
    pub agents: Vec<AgentView>,
    pub diagnostics: Vec<String>,
    pub recent: Vec<RecentEvent>,
    /// Last broadcast sequence number folded into this snapshot.
    pub sequence: u64,
}

/// Event pushed to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObserverEvent {
    Connected {
        observer_id: String,
        sequence: u64,
    },
    Progress(Progress),
    FeatureUpdate {
        feature_id: FeatureId,
        passes: bool,
        outcome: FeatureOutcome,
        agent_id: Option<String>,
    },
    AgentUpdate(AgentView),
    AgentCrashed {
        agent_id: String,
        slot: usize,
        class: WorkerClass,
        feature_ids: Vec<FeatureId>,
        reason: CrashReason,
    },
    AgentStatus {
        status: RunStatus,
    },
    OrchestratorUpdate(OrchestratorSummary),
    Snapshot(Box<Snapshot>),
    /// The observer fell behind and lost `missed` events; a snapshot follows.
    Resync {
        missed: u64,
    },
    Ping,
    Pong,
    Error {
        message: String,
    },
}

impl ObserverEvent {
    /// One-line description for the recent-event tail. Heartbeats, snapshots
    /// and orchestrator updates are not recorded.
    pub fn summary(&self) -> Option<String> {
        let text = match self {
            Self::Progress(p) => format!(
                "progress {}/{} passing ({}%)",
                p.passing, p.total, p.percentage
            ),
            Self::FeatureUpdate {
                feature_id,
                outcome,
                ..
            } => format!("feature {feature_id} {}", outcome_str(*outcome)),
            Self::AgentUpdate(agent) if agent.finished => {
                format!("agent {} finished ({})", agent.agent_id, agent.state)
            }
            Self::AgentUpdate(agent) => format!("agent {} {}", agent.agent_id, agent.state),
            Self::AgentCrashed {
                agent_id, reason, ..
            } => format!("agent {agent_id} crashed ({})", crash_str(*reason)),
            Self::AgentStatus { status } => format!("status {status}"),
            Self::Connected { .. }
            | Self::OrchestratorUpdate(_)
            | Self::Snapshot(_)
            | Self::Resync { .. }
            | Self::Ping
            | Self::Pong
            | Self::Error { .. } => return None,
        };
        Some(text)
    }
}

const fn outcome_str(outcome: FeatureOutcome) -> &'static str {
    match outcome {
        FeatureOutcome::Passed => "passed",
        FeatureOutcome::Failed => "failed",
        FeatureOutcome::Released => "released",
    }
}

const fn crash_str(reason: CrashReason) -> &'static str {
    match reason {
        CrashReason::Stale => "stale",
        CrashReason::Exited => "exited",
    }
}

/// One frame on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    pub timestamp: i64,
    #[serde(flatten)]
    pub event: ObserverEvent,
}

impl Envelope {
    /// Frame for a single observer, outside the broadcast sequence.
    pub fn direct(event: ObserverEvent) -> Self {
        Self {
            seq: None,
            timestamp: unix_timestamp(),
            event,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","message":"unserializable event: {e}"}}"#)
        })
    }
}

/// Message sent by an observer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    Pong,
    /// Ask for a full snapshot.
    Snapshot,
    Control { action: ControlAction },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn envelope_flattens_tagged_event() {
        let envelope = Envelope {
            seq: Some(7),
            timestamp: 1,
            event: ObserverEvent::FeatureUpdate {
                feature_id: 3,
                passes: true,
                outcome: FeatureOutcome::Passed,
                agent_id: Some("a1".to_string()),
            },
        };
        let value: serde_json::Value = serde_json::from_str(&envelope.to_json()).unwrap();
        assert_eq!(value["type"], "feature_update");
        assert_eq!(value["seq"], 7);
        assert_eq!(value["feature_id"], 3);
        assert_eq!(value["outcome"], "passed");
    }

    #[test]
    fn direct_frames_have_no_sequence() {
        let value: serde_json::Value =
            serde_json::from_str(&Envelope::direct(ObserverEvent::Ping).to_json()).unwrap();
        assert_eq!(value["type"], "ping");
        assert!(value.get("seq").is_none());
    }

    #[test]
    fn client_messages_parse() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Ping);
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"control","action":"soft-stop"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Control {
                action: ControlAction::SoftStop
            }
        );
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"dance"}"#).is_err());
    }

    #[test]
    fn summaries_skip_heartbeats() {
        assert!(ObserverEvent::Ping.summary().is_none());
        let crash = ObserverEvent::AgentCrashed {
            agent_id: "a1".to_string(),
            slot: 0,
            class: WorkerClass::Primary,
            feature_ids: vec![1],
            reason: CrashReason::Stale,
        };
        assert_eq!(crash.summary().as_deref(), Some("agent a1 crashed (stale)"));
    }
}
