//! Worker process plumbing.
//!
//! A worker is launched per batch through a [`WorkerLauncher`]. The launcher
//! hands the batch descriptor to the worker and returns a [`WorkerHandle`]:
//! a stream of raw stdout lines, a termination switch and an exit signal.
//! The supervisor never touches the process directly.

mod intake;
mod worker;

use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use foreman_core::{Feature, FeatureId, WorkerClass};

pub use intake::run_intake;
pub use worker::ProcessLauncher;

/// Environment variable carrying the agent id.
pub const ENV_AGENT_ID: &str = "FOREMAN_AGENT_ID";
/// Environment variable carrying the worker class.
pub const ENV_AGENT_CLASS: &str = "FOREMAN_AGENT_CLASS";
/// Environment variable carrying the comma-separated feature ids.
pub const ENV_FEATURE_IDS: &str = "FOREMAN_FEATURE_IDS";

/// A claimed batch bound to a worker slot.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub agent_id: String,
    pub class: WorkerClass,
    pub slot: usize,
    pub features: Vec<Feature>,
}

impl Assignment {
    pub fn feature_ids(&self) -> Vec<FeatureId> {
        self.features.iter().map(|f| f.id).collect()
    }

    /// What the worker reads from stdin.
    pub fn descriptor(&self) -> BatchDescriptor<'_> {
        BatchDescriptor {
            agent_id: &self.agent_id,
            class: self.class,
            features: self
                .features
                .iter()
                .map(|f| FeatureDescriptor {
                    id: f.id,
                    category: &f.category,
                    name: &f.name,
                    description: &f.description,
                    steps: &f.steps,
                })
                .collect(),
        }
    }
}

/// Batch description written to the worker's stdin as one JSON line.
#[derive(Debug, Serialize)]
pub struct BatchDescriptor<'a> {
    pub agent_id: &'a str,
    pub class: WorkerClass,
    pub features: Vec<FeatureDescriptor<'a>>,
}

#[derive(Debug, Serialize)]
pub struct FeatureDescriptor<'a> {
    pub id: FeatureId,
    pub category: &'a str,
    pub name: &'a str,
    pub description: &'a str,
    pub steps: &'a [String],
}

/// Control side of a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    pub pid: Option<u32>,
    /// Raw stdout lines. Closes when the worker's stdout does.
    pub lines: mpsc::Receiver<String>,
    terminate: Option<oneshot::Sender<()>>,
    exited: oneshot::Receiver<Option<i32>>,
}

impl WorkerHandle {
    pub const fn new(
        pid: Option<u32>,
        lines: mpsc::Receiver<String>,
        terminate: oneshot::Sender<()>,
        exited: oneshot::Receiver<Option<i32>>,
    ) -> Self {
        Self {
            pid,
            lines,
            terminate: Some(terminate),
            exited,
        }
    }

    /// Ask the launcher to stop the worker and all its descendants.
    /// Further calls are no-ops.
    pub fn terminate(&mut self) {
        if let Some(tx) = self.terminate.take() {
            let _ = tx.send(());
        }
    }

    /// Wait up to `limit` for the worker to be gone. Returns the exit code
    /// if one was observed.
    pub async fn wait_exit(&mut self, limit: Duration) -> Option<i32> {
        tokio::time::timeout(limit, &mut self.exited)
            .await
            .ok()
            .and_then(Result::ok)
            .flatten()
    }
}

/// Starts workers.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, assignment: &Assignment) -> Result<WorkerHandle, SubprocessError>;
}

/// Errors from worker and intake processes.
#[derive(Debug, thiserror::Error)]
pub enum SubprocessError {
    #[error("Failed to spawn subprocess: {reason}")]
    SpawnFailed { reason: String },

    #[error("Subprocess timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Subprocess exited with status {code:?}")]
    ExitStatus { code: Option<i32> },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_carries_feature_content() {
        let mut feature = Feature::new(4, "checkout");
        feature.category = "cart".to_string();
        feature.steps = vec!["add item".to_string()];
        let assignment = Assignment {
            agent_id: "agent-1".to_string(),
            class: WorkerClass::Primary,
            slot: 0,
            features: vec![feature],
        };

        let json = serde_json::to_value(assignment.descriptor()).unwrap();
        assert_eq!(json["agent_id"], "agent-1");
        assert_eq!(json["class"], "primary");
        assert_eq!(json["features"][0]["id"], 4);
        assert_eq!(json["features"][0]["category"], "cart");
        assert_eq!(json["features"][0]["steps"][0], "add item");
        assert!(json["features"][0].get("passes").is_none());
    }

    #[tokio::test]
    async fn handle_terminate_is_idempotent() {
        let (_line_tx, lines) = mpsc::channel(1);
        let (term_tx, mut term_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let mut handle = WorkerHandle::new(None, lines, term_tx, exit_rx);

        handle.terminate();
        handle.terminate();
        assert!(term_rx.try_recv().is_ok());

        exit_tx.send(Some(0)).unwrap();
        assert_eq!(handle.wait_exit(Duration::from_secs(1)).await, Some(0));
    }
}
