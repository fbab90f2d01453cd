//! Two-tier worker slot pool.
//!
//! [`SlotPool`] bounds concurrent workers per class with one Tokio semaphore
//! per tier. A [`SlotPermit`] carries the slot index it was given and hands
//! both the permit and the index back when dropped.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use foreman_core::WorkerClass;

/// A permit granting the right to run one worker in a given slot.
///
/// When dropped, the slot is automatically returned to the pool.
#[derive(Debug)]
pub struct SlotPermit {
    class: WorkerClass,
    slot: usize,
    free: Arc<Mutex<BTreeSet<usize>>>,
    _permit: OwnedSemaphorePermit,
}

impl SlotPermit {
    pub const fn slot(&self) -> usize {
        self.slot
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(self.slot);
        debug!(class = %self.class, slot = self.slot, "Slot released");
    }
}

/// Slots for one worker class.
#[derive(Debug)]
struct Tier {
    semaphore: Arc<Semaphore>,
    max: usize,
    free: Arc<Mutex<BTreeSet<usize>>>,
}

impl Tier {
    fn new(max: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            max,
            free: Arc::new(Mutex::new((0..max).collect())),
        }
    }

    fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Semaphore-based concurrency pool for primary and verification workers.
#[derive(Debug)]
pub struct SlotPool {
    primary: Tier,
    verification: Tier,
}

impl SlotPool {
    /// Create a pool. A zero `max_verification` disables verification.
    pub fn new(max_primary: usize, max_verification: usize) -> Self {
        info!(max_primary, max_verification, "SlotPool created");
        Self {
            primary: Tier::new(max_primary),
            verification: Tier::new(max_verification),
        }
    }

    const fn tier(&self, class: WorkerClass) -> &Tier {
        match class {
            WorkerClass::Primary => &self.primary,
            WorkerClass::Verification => &self.verification,
        }
    }

    /// Take a free slot of `class`, or `None` if the tier is full.
    pub fn try_acquire(&self, class: WorkerClass) -> Option<SlotPermit> {
        let tier = self.tier(class);
        let permit = Arc::clone(&tier.semaphore).try_acquire_owned().ok()?;
        // Holding a semaphore permit guarantees a free index.
        let slot = tier
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_first()?;
        Some(SlotPermit {
            class,
            slot,
            free: Arc::clone(&tier.free),
            _permit: permit,
        })
    }

    /// Number of free slots of `class`.
    pub fn available(&self, class: WorkerClass) -> usize {
        self.tier(class).available()
    }

    /// Number of occupied slots of `class`.
    pub fn active(&self, class: WorkerClass) -> usize {
        let tier = self.tier(class);
        tier.max - tier.available()
    }

    /// Configured limit for `class`.
    pub const fn max(&self, class: WorkerClass) -> usize {
        self.tier(class).max
    }
}
