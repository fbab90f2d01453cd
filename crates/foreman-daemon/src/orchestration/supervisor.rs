//! Agent supervisor.
//!
//! [`Supervisor`] owns the worker slots. For each batch it:
//! - takes a slot and claims the batch in the feature store
//! - launches one worker and follows its lifecycle reports
//! - reclaims the batch if the worker goes silent past the stale window or
//!   exits without a terminal report
//! - resolves the batch exactly once, whatever the worker sends afterwards
//!
//! Each worker is followed by its own monitor task; the orchestrator loop
//! never waits on worker I/O.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, RwLock, oneshot, watch};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};

use foreman_core::config::OrchestratorConfig;
use foreman_core::db::unix_timestamp;
use foreman_core::report::parse_line;
use foreman_core::{AgentState, Feature, FeatureId, WorkerClass, WorkerReport};

use crate::broadcast::EventHub;
use crate::broadcast::events::{AgentView, CrashReason, FeatureOutcome, ObserverEvent, Progress};
use crate::storage::{Database, DatabaseError, NewTestRun};
use crate::subprocess::{Assignment, SubprocessError, WorkerHandle, WorkerLauncher};

use super::pool::{SlotPermit, SlotPool};
use super::scheduler::Batch;

/// Errors from the supervisor.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Failed to launch worker {agent_id}: {source}")]
    Launch {
        agent_id: String,
        #[source]
        source: SubprocessError,
    },
}

/// Supervisor limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub max_primary: usize,
    pub max_verification: usize,
    pub stale_timeout: Duration,
    pub terminate_timeout: Duration,
}

impl From<&OrchestratorConfig> for SupervisorConfig {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            max_primary: config.max_primary,
            max_verification: config.max_verification,
            stale_timeout: config.stale_timeout(),
            terminate_timeout: config.terminate_timeout(),
        }
    }
}

/// How a worker's run ended.
#[derive(Debug)]
enum Ending {
    Terminal(WorkerReport),
    Crashed(CrashReason),
    Aborted,
}

/// Per-feature resolution of a terminated batch.
#[derive(Debug, Default, PartialEq, Eq)]
struct Resolution {
    passed: Vec<FeatureId>,
    failed: Vec<FeatureId>,
    released: Vec<FeatureId>,
    /// Outcomes written to the test-run history.
    runs: Vec<(FeatureId, bool)>,
}

impl Resolution {
    /// Decide each feature's fate from a terminal report.
    ///
    /// With explicit results only the listed features are resolved and the
    /// rest go back to pending. Without them `success` passes the whole
    /// batch and `error` releases it.
    fn from_report(batch: &[FeatureId], report: &WorkerReport) -> Self {
        let mut out = Self::default();
        if let Some(results) = &report.results {
            let outcomes: HashMap<FeatureId, bool> =
                results.iter().map(|r| (r.id, r.passes)).collect();
            for &id in batch {
                match outcomes.get(&id) {
                    Some(true) => out.passed.push(id),
                    Some(false) => out.failed.push(id),
                    None => out.released.push(id),
                }
                if let Some(&passes) = outcomes.get(&id) {
                    out.runs.push((id, passes));
                }
            }
        } else if report.state == AgentState::Success {
            out.passed = batch.to_vec();
            out.runs = batch.iter().map(|&id| (id, true)).collect();
        } else {
            out.released = batch.to_vec();
            out.runs = batch.iter().map(|&id| (id, false)).collect();
        }
        out
    }

    fn release_all(batch: &[FeatureId]) -> Self {
        Self {
            released: batch.to_vec(),
            ..Self::default()
        }
    }
}

struct RunningAgent {
    view: AgentView,
    abort: Option<oneshot::Sender<()>>,
}

struct SupervisorInner {
    store: Database,
    hub: EventHub,
    launcher: Arc<dyn WorkerLauncher>,
    pool: SlotPool,
    config: SupervisorConfig,
    agents: RwLock<HashMap<String, RunningAgent>>,
    slot_freed: Arc<Notify>,
    active: watch::Sender<usize>,
}

/// Handle to the agent supervisor.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    pub fn new(
        store: Database,
        hub: EventHub,
        launcher: Arc<dyn WorkerLauncher>,
        config: SupervisorConfig,
    ) -> Self {
        let (active, _) = watch::channel(0);
        Self {
            inner: Arc::new(SupervisorInner {
                store,
                hub,
                launcher,
                pool: SlotPool::new(config.max_primary, config.max_verification),
                config,
                agents: RwLock::new(HashMap::new()),
                slot_freed: Arc::new(Notify::new()),
                active,
            }),
        }
    }

    /// Notified every time a worker slot is freed.
    pub fn slot_freed(&self) -> Arc<Notify> {
        Arc::clone(&self.inner.slot_freed)
    }

    pub fn free_slots(&self, class: WorkerClass) -> usize {
        self.inner.pool.available(class)
    }

    pub fn active(&self, class: WorkerClass) -> usize {
        self.inner.pool.active(class)
    }

    pub fn active_total(&self) -> usize {
        self.active(WorkerClass::Primary) + self.active(WorkerClass::Verification)
    }

    pub fn max(&self, class: WorkerClass) -> usize {
        self.inner.pool.max(class)
    }

    /// Views of every running worker, by class then slot.
    pub async fn agents(&self) -> Vec<AgentView> {
        let mut views: Vec<AgentView> = self
            .inner
            .agents
            .read()
            .await
            .values()
            .map(|a| a.view.clone())
            .collect();
        views.sort_by_key(|v| (v.class == WorkerClass::Verification, v.slot));
        views
    }

    /// Start a worker for `batch`.
    ///
    /// Returns `Ok(None)` when no slot of the batch's class is free or the
    /// claim lost a race; either way nothing changed and the next tick may
    /// retry.
    pub async fn spawn(&self, batch: Batch) -> Result<Option<AgentView>, SupervisorError> {
        let inner = &self.inner;
        let Some(permit) = inner.pool.try_acquire(batch.class) else {
            debug!(class = %batch.class, "No free slot");
            return Ok(None);
        };

        let feature_ids = batch.ids();
        if !inner.store.claim_batch(&feature_ids).await? {
            debug!(?feature_ids, "Claim lost, retrying next tick");
            return Ok(None);
        }

        let assignment = Assignment {
            agent_id: uuid::Uuid::new_v4().to_string(),
            class: batch.class,
            slot: permit.slot(),
            features: batch.features,
        };
        let now = unix_timestamp();
        let mut view = AgentView {
            agent_id: assignment.agent_id.clone(),
            slot: assignment.slot,
            class: assignment.class,
            feature_ids,
            state: AgentState::Idle,
            note: None,
            started_at: now,
            last_heartbeat: now,
            finished: false,
        };

        let handle = match inner.launcher.launch(&assignment) {
            Ok(handle) => handle,
            Err(source) => {
                warn!(agent_id = %view.agent_id, error = %source, "Worker launch failed");
                view.state = AgentState::Error;
                view.note = Some(format!("launch failed: {source}"));
                view.finished = true;
                inner
                    .apply(&assignment, Resolution::release_all(&view.feature_ids))
                    .await;
                inner.hub.publish(ObserverEvent::AgentUpdate(view));
                drop(permit);
                inner.slot_freed.notify_one();
                return Err(SupervisorError::Launch {
                    agent_id: assignment.agent_id,
                    source,
                });
            }
        };

        let (abort_tx, abort_rx) = oneshot::channel();
        {
            let mut agents = inner.agents.write().await;
            agents.insert(
                assignment.agent_id.clone(),
                RunningAgent {
                    view: view.clone(),
                    abort: Some(abort_tx),
                },
            );
        }
        inner.active.send_modify(|n| *n += 1);

        info!(
            agent_id = %view.agent_id,
            class = %view.class,
            slot = view.slot,
            feature_ids = ?view.feature_ids,
            "Agent started"
        );
        inner.hub.publish(ObserverEvent::AgentUpdate(view.clone()));

        tokio::spawn(Arc::clone(inner).monitor(assignment, handle, permit, abort_rx));
        Ok(Some(view))
    }

    /// Stop every running worker. Their batches are released.
    pub async fn abort_all(&self) -> usize {
        let mut agents = self.inner.agents.write().await;
        let mut count = 0;
        for agent in agents.values_mut() {
            if let Some(abort) = agent.abort.take() {
                let _ = abort.send(());
                count += 1;
            }
        }
        drop(agents);
        if count > 0 {
            info!(count, "Aborting all agents");
        }
        count
    }

    /// Wait until every worker has exited and freed its slot. Returns `false`
    /// on timeout.
    pub async fn wait_idle(&self, limit: Duration) -> bool {
        let mut active = self.inner.active.subscribe();
        tokio::time::timeout(limit, active.wait_for(|n| *n == 0))
            .await
            .is_ok_and(|r| r.is_ok())
    }
}

impl SupervisorInner {
    async fn monitor(
        self: Arc<Self>,
        assignment: Assignment,
        mut handle: WorkerHandle,
        permit: SlotPermit,
        mut abort: oneshot::Receiver<()>,
    ) {
        let agent_id = assignment.agent_id.clone();
        let stale_timeout = self.config.stale_timeout;
        let mut deadline = Instant::now() + stale_timeout;

        let ending = loop {
            tokio::select! {
                biased;
                _ = &mut abort => break Ending::Aborted,
                line = handle.lines.recv() => {
                    let Some(line) = line else {
                        break Ending::Crashed(CrashReason::Exited);
                    };
                    let Some(report) = self.on_report_line(&agent_id, &line).await else {
                        continue;
                    };
                    deadline = Instant::now() + stale_timeout;
                    if report.is_terminal() {
                        break Ending::Terminal(report);
                    }
                }
                () = sleep_until(deadline) => break Ending::Crashed(CrashReason::Stale),
            }
        };

        let batch = assignment.feature_ids();
        let grace = self.config.terminate_timeout;
        let (state, note) = match ending {
            Ending::Terminal(report) => {
                info!(agent_id, state = %report.state, "Agent reported terminal state");
                let resolution = Resolution::from_report(&batch, &report);
                self.apply(&assignment, resolution).await;
                self.drain(&agent_id, &mut handle, &mut abort).await;
                handle.terminate();
                handle.wait_exit(grace * 2).await;
                (report.state, report.note)
            }
            Ending::Crashed(reason) => {
                warn!(agent_id, ?reason, feature_ids = ?batch, "Agent crashed, reclaiming batch");
                handle.terminate();
                let code = handle.wait_exit(grace * 2).await;
                self.apply(&assignment, Resolution::release_all(&batch)).await;
                self.hub.publish(ObserverEvent::AgentCrashed {
                    agent_id: agent_id.clone(),
                    slot: assignment.slot,
                    class: assignment.class,
                    feature_ids: batch.clone(),
                    reason,
                });
                let note = match reason {
                    CrashReason::Stale => {
                        format!("no report for {}s", stale_timeout.as_secs())
                    }
                    CrashReason::Exited => format!("exited without a result (code {code:?})"),
                };
                (AgentState::Error, Some(note))
            }
            Ending::Aborted => {
                info!(agent_id, "Stopping agent");
                handle.terminate();
                handle.wait_exit(grace * 2).await;
                self.apply(&assignment, Resolution::release_all(&batch)).await;
                (AgentState::Error, Some("stopped".to_string()))
            }
        };

        self.finish(&agent_id, state, note, permit).await;
    }

    /// Parse one stdout line and record it. Returns the report if it was a
    /// recognised lifecycle state.
    async fn on_report_line(&self, agent_id: &str, line: &str) -> Option<WorkerReport> {
        let report = match parse_line(line) {
            Ok(report) => report,
            Err(e) => {
                debug!(agent_id, error = %e, "Ignoring worker output line");
                return None;
            }
        };
        if let AgentState::Unknown(raw) = &report.state {
            // Still proof of life, but not a transition.
            warn!(agent_id, state = %raw, "Ignoring unknown worker state");
            if let Some(agent) = self.agents.write().await.get_mut(agent_id) {
                agent.view.last_heartbeat = unix_timestamp();
            }
            return Some(report);
        }

        let view = {
            let mut agents = self.agents.write().await;
            let agent = agents.get_mut(agent_id)?;
            if !agent.view.state.expects(&report.state) {
                debug!(
                    agent_id,
                    from = %agent.view.state,
                    to = %report.state,
                    "Unexpected lifecycle transition"
                );
            }
            agent.view.state = report.state.clone();
            if report.note.is_some() {
                agent.view.note.clone_from(&report.note);
            }
            agent.view.last_heartbeat = unix_timestamp();
            agent.view.clone()
        };

        debug!(agent_id, state = %view.state, "Agent transition");
        self.hub.publish(ObserverEvent::AgentUpdate(view));
        Some(report)
    }

    /// Consume whatever the worker prints after its terminal report, for at
    /// most the terminate grace period.
    async fn drain(
        &self,
        agent_id: &str,
        handle: &mut WorkerHandle,
        abort: &mut oneshot::Receiver<()>,
    ) {
        let grace = tokio::time::sleep(self.config.terminate_timeout);
        tokio::pin!(grace);
        loop {
            tokio::select! {
                _ = &mut *abort => return,
                () = &mut grace => return,
                line = handle.lines.recv() => match line {
                    None => return,
                    Some(line) => match parse_line(&line) {
                        Ok(report) if report.is_terminal() => {
                            warn!(agent_id, state = %report.state, "Ignoring duplicate terminal report");
                        }
                        Ok(report) => {
                            debug!(agent_id, state = %report.state, "Ignoring report after terminal state");
                        }
                        Err(_) => {}
                    },
                },
            }
        }
    }

    /// Write a resolution to the store, then tell observers.
    async fn apply(&self, assignment: &Assignment, resolution: Resolution) {
        let agent_id = assignment.agent_id.as_str();
        let was_passing: HashMap<FeatureId, bool> = assignment
            .features
            .iter()
            .map(|f: &Feature| (f.id, f.passes))
            .collect();
        let mut updates = Vec::new();

        for &id in &resolution.passed {
            match self.store.mark_passed(id).await {
                Ok(()) => updates.push((id, true, FeatureOutcome::Passed)),
                Err(e) => self.recover(agent_id, id, &e).await,
            }
        }
        for &id in &resolution.failed {
            match self.store.mark_failed(id).await {
                Ok(()) => updates.push((id, false, FeatureOutcome::Failed)),
                Err(e) => self.recover(agent_id, id, &e).await,
            }
        }
        if !resolution.released.is_empty() {
            match self.store.release(&resolution.released).await {
                Ok(_) => updates.extend(resolution.released.iter().map(|&id| {
                    let passes = was_passing.get(&id).copied().unwrap_or(false);
                    (id, passes, FeatureOutcome::Released)
                })),
                Err(e) => {
                    error!(agent_id, error = %e, ids = ?resolution.released, "Failed to release batch");
                }
            }
        }

        let runs: Vec<NewTestRun> = resolution
            .runs
            .iter()
            .map(|&(feature_id, passes)| NewTestRun {
                feature_id,
                passes,
                worker_class: assignment.class,
                agent_id: agent_id.to_string(),
                note: None,
            })
            .collect();
        if let Err(e) = self.store.record_test_runs(&runs).await {
            error!(agent_id, error = %e, "Failed to record test runs");
        }

        for (feature_id, passes, outcome) in updates {
            self.hub.publish(ObserverEvent::FeatureUpdate {
                feature_id,
                passes,
                outcome,
                agent_id: Some(agent_id.to_string()),
            });
        }
        match self.store.feature_stats().await {
            Ok(stats) => {
                self.hub.publish(ObserverEvent::Progress(Progress::from(stats)));
            }
            Err(e) => error!(error = %e, "Failed to read feature stats"),
        }
    }

    /// A mark failed: try at least to drop the claim.
    async fn recover(&self, agent_id: &str, id: FeatureId, cause: &DatabaseError) {
        error!(agent_id, feature_id = id, error = %cause, "Failed to record feature outcome");
        if let Err(e) = self.store.release(&[id]).await {
            error!(agent_id, feature_id = id, error = %e, "Failed to release feature");
        }
    }

    /// Retire the agent and free its slot.
    async fn finish(
        &self,
        agent_id: &str,
        state: AgentState,
        note: Option<String>,
        permit: SlotPermit,
    ) {
        let removed = self.agents.write().await.remove(agent_id);

        if let Some(RunningAgent { mut view, .. }) = removed {
            view.state = state;
            if note.is_some() {
                view.note = note;
            }
            view.finished = true;
            self.hub.publish(ObserverEvent::AgentUpdate(view));
        }

        drop(permit);
        self.active.send_modify(|n| *n = n.saturating_sub(1));
        info!(agent_id, "Agent finished, slot freed");
        self.slot_freed.notify_one();
    }
}
