//! Orchestrator loop.
//!
//! One [`Orchestrator::tick`] re-reads the backlog, partitions it, proposes
//! batches for the free slots and hands them to the [`Supervisor`]. The loop
//! ticks on a fixed interval, whenever a slot frees and whenever a control
//! action or new feature asks for it.
//!
//! Ticks and control actions serialize on one async mutex around
//! [`RunState`]. A soft-stop therefore never interleaves with a tick that is
//! still claiming batches.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use foreman_core::config::OrchestratorConfig;
use foreman_core::{Config, FeatureStats, WorkerClass};

use crate::broadcast::EventHub;
use crate::broadcast::events::{Counts, ObserverEvent, OrchestratorSummary, Progress, Snapshot};
use crate::storage::{Database, DatabaseError};
use crate::subprocess::{WorkerLauncher, run_intake};

use super::readiness::{Partition, partition};
use super::scheduler::{Batch, Scheduler, is_stalled};
use super::state::{LoopState, RunStatus};
use super::supervisor::{Supervisor, SupervisorConfig, SupervisorError};

/// Errors from the orchestrator loop.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),
}

/// Progress of the one-shot intake step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(super) enum IntakeState {
    #[default]
    NotRun,
    Running,
    Done,
}

#[derive(Debug, Clone)]
struct IntakeSettings {
    command: Vec<String>,
    working_directory: Option<PathBuf>,
}

/// Mutable orchestrator state.
#[derive(Debug, Default)]
pub(super) struct RunState {
    pub(super) status: RunStatus,
    pub(super) loop_state: LoopState,
    pub(super) intake: IntakeState,
    /// Readiness counters from the last partition.
    pub(super) counts: Counts,
    /// Last `orchestrator_update` sent, to skip duplicates.
    last_update: Option<(LoopState, RunStatus, Counts)>,
    stalled_reported: bool,
}

pub(super) struct OrchestratorInner {
    pub(super) store: Database,
    pub(super) hub: EventHub,
    pub(super) supervisor: Supervisor,
    pub(super) scheduler: Scheduler,
    pub(super) config: OrchestratorConfig,
    intake: Option<IntakeSettings>,
    pub(super) run: Mutex<RunState>,
    pub(super) wake: Notify,
}

/// Handle to the orchestrator. Clones share state.
#[derive(Clone)]
pub struct Orchestrator {
    pub(super) inner: Arc<OrchestratorInner>,
}

impl Orchestrator {
    /// Create a stopped orchestrator. Call [`Orchestrator::start`] to begin
    /// scheduling.
    pub fn new(
        store: Database,
        hub: EventHub,
        launcher: Arc<dyn WorkerLauncher>,
        config: &Config,
    ) -> Self {
        let orchestrator = config.orchestrator.clone();
        let supervisor = Supervisor::new(
            store.clone(),
            hub.clone(),
            launcher,
            SupervisorConfig::from(&orchestrator),
        );
        let intake = config
            .worker
            .intake_command
            .clone()
            .filter(|command| !command.is_empty())
            .map(|command| IntakeSettings {
                command,
                working_directory: config.worker.working_directory.clone(),
            });

        info!(
            max_primary = orchestrator.max_primary,
            max_verification = orchestrator.max_verification,
            batch_size = orchestrator.batch_size,
            intake = intake.is_some(),
            "Orchestrator created"
        );
        Self {
            inner: Arc::new(OrchestratorInner {
                store,
                hub,
                supervisor,
                scheduler: Scheduler::new(orchestrator.batch_size),
                config: orchestrator,
                intake,
                run: Mutex::new(RunState::default()),
                wake: Notify::new(),
            }),
        }
    }

    pub fn store(&self) -> &Database {
        &self.inner.store
    }

    pub fn hub(&self) -> &EventHub {
        &self.inner.hub
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.inner.supervisor
    }

    pub async fn status(&self) -> RunStatus {
        self.inner.run.lock().await.status
    }

    pub async fn loop_state(&self) -> LoopState {
        self.inner.run.lock().await.loop_state
    }

    /// Ask the loop for an early tick.
    pub fn wake(&self) {
        self.inner.wake.notify_one();
    }

    /// Drive the loop until `shutdown` flips to `true` (or its sender goes
    /// away).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let slot_freed = self.inner.supervisor.slot_freed();
        let mut interval = tokio::time::interval(self.inner.config.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            tick_ms = self.inner.config.tick_interval_ms,
            "Orchestrator loop started"
        );
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {}
                () = slot_freed.notified() => debug!("Slot freed, rescheduling"),
                () = self.inner.wake.notified() => debug!("Woken, rescheduling"),
            }
            if let Err(e) = self.tick().await {
                error!(error = %e, "Scheduling tick failed");
            }
        }
        info!("Orchestrator loop stopped");
    }

    /// Run one scheduling cycle.
    pub async fn tick(&self) -> Result<(), OrchestratorError> {
        let mut run = self.inner.run.lock().await;
        if run.status == RunStatus::Finishing {
            self.drain_step(&mut run);
            return Ok(());
        }
        if !run.status.schedules() {
            return Ok(());
        }

        let features = match self.inner.store.list_features().await {
            Ok(features) => features,
            Err(e) => {
                self.set_status(&mut run, RunStatus::Crashed);
                return Err(e.into());
            }
        };
        if run.status == RunStatus::Crashed {
            info!("Feature store reachable again");
            self.set_status(&mut run, RunStatus::Running);
        }

        if features.is_empty() {
            run.counts = self.counts(&Partition::default());
            self.on_empty_backlog(&mut run);
            return Ok(());
        }

        let batches = {
            let partition = partition(&features);
            run.counts = self.counts(&partition);
            self.set_loop_state(&mut run, LoopState::Scheduling);
            let active = self.inner.supervisor.active_total();

            if partition.all_passing() && active == 0 {
                self.set_loop_state(&mut run, LoopState::Complete);
                return Ok(());
            }
            if is_stalled(&partition, active) {
                self.report_stall(&mut run, &partition);
                self.set_loop_state(&mut run, LoopState::Stalled);
                return Ok(());
            }
            run.stalled_reported = false;
            self.select_batches(&partition)
        };

        if !batches.is_empty() {
            self.set_loop_state(&mut run, LoopState::Spawning);
            let mut started = 0usize;
            for batch in batches {
                match self.inner.supervisor.spawn(batch).await {
                    Ok(Some(_)) => started += 1,
                    Ok(None) => {}
                    Err(SupervisorError::Launch { agent_id, source }) => {
                        warn!(agent_id, error = %source, "Batch released after launch failure");
                    }
                    Err(e @ SupervisorError::Database(_)) => {
                        self.set_status(&mut run, RunStatus::Crashed);
                        return Err(e.into());
                    }
                }
            }
            debug!(started, "Spawn pass finished");
            run.counts.active_primary = self.inner.supervisor.active(WorkerClass::Primary);
            run.counts.active_verification =
                self.inner.supervisor.active(WorkerClass::Verification);
        }

        self.set_loop_state(&mut run, LoopState::Monitoring);
        drop(run);
        Ok(())
    }

    /// Full state for an observer that has no history.
    pub async fn snapshot(&self) -> Result<Snapshot, OrchestratorError> {
        // Taken first: every event after it is either folded in below or
        // delivered again.
        let sequence = self.inner.hub.sequence();
        let features = self.inner.store.list_features().await?;
        let partition = partition(&features);
        let agents = self.inner.supervisor.agents().await;
        let run = self.inner.run.lock().await;

        Ok(Snapshot {
            status: run.status,
            loop_state: run.loop_state,
            progress: Progress::from(FeatureStats::from_features(&features)),
            counts: self.counts(&partition),
            features: partition.ids(),
            agents,
            diagnostics: partition
                .diagnostics
                .iter()
                .map(ToString::to_string)
                .collect(),
            recent: self.inner.hub.recent(),
            sequence,
        })
    }

    fn select_batches(&self, partition: &Partition<'_>) -> Vec<Batch> {
        let supervisor = &self.inner.supervisor;
        let scheduler = &self.inner.scheduler;
        let mut rng = rand::rng();

        let mut batches = scheduler.select_next_batch(
            WorkerClass::Primary,
            supervisor.free_slots(WorkerClass::Primary),
            partition,
            &mut rng,
        );
        // Re-checks run alongside new work only, so a finished or stuck
        // backlog settles.
        if !partition.ready.is_empty() || supervisor.active(WorkerClass::Primary) > 0 {
            batches.extend(scheduler.select_next_batch(
                WorkerClass::Verification,
                supervisor.free_slots(WorkerClass::Verification),
                partition,
                &mut rng,
            ));
        }
        batches
    }

    fn on_empty_backlog(&self, run: &mut RunState) {
        match (run.intake, &self.inner.intake) {
            (IntakeState::NotRun, Some(intake)) => {
                run.intake = IntakeState::Running;
                self.set_loop_state(run, LoopState::Initializing);
                self.spawn_intake(intake.clone());
            }
            (IntakeState::Running, _) => {}
            (IntakeState::NotRun, None) => {
                info!("Backlog is empty, waiting for features");
                run.intake = IntakeState::Done;
                self.set_loop_state(run, LoopState::Idle);
            }
            (IntakeState::Done, _) => self.set_loop_state(run, LoopState::Idle),
        }
    }

    fn spawn_intake(&self, intake: IntakeSettings) {
        let this = self.clone();
        let limit = self.inner.config.intake_timeout();
        info!(command = ?intake.command, "Backlog is empty, running intake");
        tokio::spawn(async move {
            if let Err(e) =
                run_intake(&intake.command, intake.working_directory.as_deref(), limit).await
            {
                warn!(error = %e, "Intake did not complete");
            }
            this.inner.run.lock().await.intake = IntakeState::Done;
            this.wake();
        });
    }

    /// Finishing: stop once the last worker is gone.
    pub(super) fn drain_step(&self, run: &mut RunState) {
        let active = self.inner.supervisor.active_total();
        run.counts.active_primary = self.inner.supervisor.active(WorkerClass::Primary);
        run.counts.active_verification = self.inner.supervisor.active(WorkerClass::Verification);
        if active == 0 {
            info!("All workers drained");
            self.set_status(run, RunStatus::Stopped);
            self.set_loop_state(run, LoopState::Stopped);
        } else {
            debug!(active, "Draining workers");
            self.set_loop_state(run, LoopState::Finishing);
        }
    }

    fn report_stall(&self, run: &mut RunState, partition: &Partition<'_>) {
        if run.stalled_reported {
            return;
        }
        run.stalled_reported = true;
        warn!(
            blocked = partition.blocked.len(),
            "Backlog stalled: nothing is ready and no worker is active"
        );
        for diagnostic in &partition.diagnostics {
            warn!(%diagnostic, "Dependency problem");
        }
    }

    fn counts(&self, partition: &Partition<'_>) -> Counts {
        let supervisor = &self.inner.supervisor;
        Counts {
            active_primary: supervisor.active(WorkerClass::Primary),
            active_verification: supervisor.active(WorkerClass::Verification),
            max_primary: supervisor.max(WorkerClass::Primary),
            max_verification: supervisor.max(WorkerClass::Verification),
            ready: partition.ready.len(),
            blocked: partition.blocked.len(),
            claimed: partition.claimed.len(),
            done: partition.done.len(),
        }
    }

    pub(super) fn set_status(&self, run: &mut RunState, status: RunStatus) {
        if run.status == status {
            return;
        }
        info!(from = %run.status, to = %status, "Run status changed");
        run.status = status;
        self.inner.hub.publish(ObserverEvent::AgentStatus { status });
        self.publish_update(run);
    }

    pub(super) fn set_loop_state(&self, run: &mut RunState, state: LoopState) {
        if run.loop_state != state {
            debug!(from = %run.loop_state, to = %state, "Loop state changed");
            run.loop_state = state;
        }
        self.publish_update(run);
    }

    /// Send `orchestrator_update` if anything it carries changed.
    fn publish_update(&self, run: &mut RunState) {
        let key = (run.loop_state, run.status, run.counts);
        if run.last_update == Some(key) {
            return;
        }
        run.last_update = Some(key);
        self.inner
            .hub
            .publish(ObserverEvent::OrchestratorUpdate(OrchestratorSummary {
                loop_state: run.loop_state,
                status: run.status,
                counts: run.counts,
                recent: self.inner.hub.recent(),
            }));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use foreman_core::NewFeature;

    use super::*;
    use crate::subprocess::{Assignment, SubprocessError, WorkerHandle};

    struct NoLauncher;

    impl WorkerLauncher for NoLauncher {
        fn launch(&self, _assignment: &Assignment) -> Result<WorkerHandle, SubprocessError> {
            Err(SubprocessError::SpawnFailed {
                reason: "no workers in this test".to_string(),
            })
        }
    }

    async fn orchestrator(config: &Config) -> Orchestrator {
        let store = Database::open_in_memory().await.unwrap();
        Orchestrator::new(store, EventHub::with_defaults(), Arc::new(NoLauncher), config)
    }

    #[tokio::test]
    async fn stopped_orchestrator_does_not_schedule() {
        let orch = orchestrator(&Config::default()).await;
        orch.store().create_feature(&NewFeature::new("a")).await.unwrap();

        orch.tick().await.unwrap();
        assert_eq!(orch.loop_state().await, LoopState::Idle);
        assert!(!orch.store().get_feature(1).await.unwrap().in_progress);
    }

    #[tokio::test]
    async fn empty_backlog_without_intake_idles() {
        let orch = orchestrator(&Config::default()).await;
        orch.start().await;
        orch.tick().await.unwrap();
        assert_eq!(orch.loop_state().await, LoopState::Idle);
        assert_eq!(orch.status().await, RunStatus::Running);
    }

    #[tokio::test]
    async fn launch_failure_releases_claim() {
        let orch = orchestrator(&Config::default()).await;
        orch.store().create_feature(&NewFeature::new("a")).await.unwrap();
        orch.start().await;

        orch.tick().await.unwrap();
        let feature = orch.store().get_feature(1).await.unwrap();
        assert!(!feature.in_progress);
        assert!(!feature.passes);
        assert_eq!(orch.supervisor().active_total(), 0);
    }

    #[tokio::test]
    async fn scheduling_update_carries_fresh_counts() {
        let orch = orchestrator(&Config::default()).await;
        orch.store()
            .create_features(&[
                NewFeature::new("a"),
                NewFeature::new("b").with_dependencies(vec![1]),
            ])
            .await
            .unwrap();
        let mut events = orch.hub().subscribe("test", "test").unwrap().events;
        orch.start().await;

        orch.tick().await.unwrap();
        let mut scheduling = None;
        while let Ok(envelope) = events.try_recv() {
            if let ObserverEvent::OrchestratorUpdate(summary) = envelope.event
                && summary.loop_state == LoopState::Scheduling
            {
                scheduling = Some(summary);
                break;
            }
        }
        let summary = scheduling.unwrap();
        assert_eq!(summary.counts.ready, 1);
        assert_eq!(summary.counts.blocked, 1);
    }

    #[tokio::test]
    async fn passing_backlog_is_complete() {
        let orch = orchestrator(&Config::default()).await;
        let f = orch.store().create_feature(&NewFeature::new("a")).await.unwrap();
        orch.store().mark_passed(f.id).await.unwrap();
        orch.start().await;

        orch.tick().await.unwrap();
        assert_eq!(orch.loop_state().await, LoopState::Complete);
    }

    #[tokio::test]
    async fn unknown_dependency_stalls() {
        let orch = orchestrator(&Config::default()).await;
        orch.store()
            .create_feature(&NewFeature::new("a").with_dependencies(vec![42]))
            .await
            .unwrap();
        orch.start().await;

        orch.tick().await.unwrap();
        assert_eq!(orch.loop_state().await, LoopState::Stalled);
        let snapshot = orch.snapshot().await.unwrap();
        assert_eq!(snapshot.features.blocked, vec![1]);
        assert_eq!(snapshot.diagnostics.len(), 1);
        assert!(snapshot.diagnostics[0].contains("42"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn intake_runs_once_for_empty_backlog() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("runs");
        let mut config = Config::default();
        config.worker.intake_command = Some(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!("echo run >> {}", marker.display()),
        ]);
        let orch = orchestrator(&config).await;
        orch.start().await;

        orch.tick().await.unwrap();
        assert_eq!(orch.loop_state().await, LoopState::Initializing);
        for _ in 0..100 {
            if orch.inner.run.lock().await.intake == IntakeState::Done {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        orch.tick().await.unwrap();
        orch.tick().await.unwrap();

        let runs = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(runs.lines().count(), 1);
        assert_eq!(orch.loop_state().await, LoopState::Idle);
    }
}
