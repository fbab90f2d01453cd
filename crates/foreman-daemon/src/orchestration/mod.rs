//! Feature orchestration: readiness, batch selection, worker slots and
//! supervision, the scheduling loop and run control.
//!
//! - [`readiness`]: partitions a backlog snapshot and reports dependency
//!   problems.
//! - [`Scheduler`]: proposes batches for free slots.
//! - [`SlotPool`]: two-tier bound on concurrent workers.
//! - [`Supervisor`]: runs one worker per batch and resolves its outcome.
//! - [`Orchestrator`]: the loop tying them together, plus the control
//!   actions in [`shutdown`].

pub mod orchestrator;
pub mod pool;
pub mod readiness;
pub mod scheduler;
pub mod shutdown;
pub mod state;
pub mod supervisor;

pub use orchestrator::{Orchestrator, OrchestratorError};
pub use pool::{SlotPermit, SlotPool};
pub use readiness::{Diagnostic, Partition, PartitionIds, partition};
pub use scheduler::{Batch, Scheduler};
pub use shutdown::ControlAction;
pub use state::{LoopState, RunStatus};
pub use supervisor::{Supervisor, SupervisorConfig, SupervisorError};
