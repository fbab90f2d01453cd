//! Batch selection.
//!
//! Primary batches take ready features in `(priority, id)` order and pack up
//! to `batch_size` of them per free slot. Verification batches re-check a
//! random sample of passing features, one feature per batch.
//!
//! Selection is a proposal only: a batch becomes real once the feature store
//! accepts its claim.

use rand::Rng;
use rand::seq::SliceRandom;

use foreman_core::{Feature, FeatureId, WorkerClass};

use super::readiness::Partition;

/// Most verification batches proposed per tick.
pub const VERIFICATION_SAMPLE: usize = 3;

/// Features handed to one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub class: WorkerClass,
    pub features: Vec<Feature>,
}

impl Batch {
    pub fn ids(&self) -> Vec<FeatureId> {
        self.features.iter().map(|f| f.id).collect()
    }
}

/// Picks batches for free worker slots.
#[derive(Debug, Clone, Copy)]
pub struct Scheduler {
    batch_size: usize,
}

impl Scheduler {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    pub const fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Propose up to `free_slots` batches of `class` from `partition`.
    pub fn select_next_batch<R: Rng + ?Sized>(
        &self,
        class: WorkerClass,
        free_slots: usize,
        partition: &Partition<'_>,
        rng: &mut R,
    ) -> Vec<Batch> {
        if free_slots == 0 {
            return Vec::new();
        }
        match class {
            WorkerClass::Primary => self.select_primary(&partition.ready, free_slots),
            WorkerClass::Verification => select_verification(&partition.done, free_slots, rng),
        }
    }

    fn select_primary(&self, ready: &[&Feature], free_slots: usize) -> Vec<Batch> {
        ready
            .chunks(self.batch_size)
            .take(free_slots)
            .map(|chunk| Batch {
                class: WorkerClass::Primary,
                features: chunk.iter().map(|&f| f.clone()).collect(),
            })
            .collect()
    }
}

fn select_verification<R: Rng + ?Sized>(
    passing: &[&Feature],
    free_slots: usize,
    rng: &mut R,
) -> Vec<Batch> {
    let mut sample = passing.to_vec();
    sample.shuffle(rng);
    sample.truncate(VERIFICATION_SAMPLE.min(free_slots));
    sample
        .into_iter()
        .map(|f| Batch {
            class: WorkerClass::Verification,
            features: vec![f.clone()],
        })
        .collect()
}

/// No feature can make progress: nothing is ready, nothing is running and the
/// backlog is unfinished.
pub fn is_stalled(partition: &Partition<'_>, active_agents: usize) -> bool {
    partition.total() > 0
        && partition.ready.is_empty()
        && active_agents == 0
        && !partition.all_passing()
}
