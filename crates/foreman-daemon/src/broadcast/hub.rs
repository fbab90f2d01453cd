//! Event hub for observer fan-out.
//!
//! Every observer gets its own bounded queue (a `broadcast` receiver). When
//! an observer falls more than `capacity` events behind, the oldest events
//! are dropped for it alone and it learns how many it missed.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::{debug, info};

use foreman_core::db::unix_timestamp;

use super::events::{Envelope, ObserverEvent, RecentEvent};

/// Hub sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubConfig {
    /// Per-observer queue length.
    pub capacity: usize,
    /// Entries kept in the recent-event tail.
    pub recent_events: usize,
    pub max_observers: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            recent_events: 20,
            max_observers: 64,
        }
    }
}

/// Errors from the event hub.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("Too many observers (max {max})")]
    TooManyObservers { max: usize },

    #[error("Observer already connected: {observer_id}")]
    AlreadyConnected { observer_id: String },
}

/// Liveness of a connected observer.
#[derive(Debug, Clone, Copy)]
struct ObserverInfo {
    last_seen: Instant,
}

/// Receiving side handed to an observer connection.
#[derive(Debug)]
pub struct ObserverHandle {
    pub observer_id: String,
    pub events: broadcast::Receiver<Envelope>,
    /// Sequence number of the last event published before subscribing.
    pub sequence: u64,
}

/// Hub statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct HubStats {
    pub observers: usize,
    pub sequence: u64,
    pub capacity: usize,
}

#[derive(Debug, Default)]
struct HubState {
    sequence: u64,
    recent: VecDeque<RecentEvent>,
    observers: HashMap<String, ObserverInfo>,
}

impl HubState {
    const fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }
}

#[derive(Debug)]
struct HubInner {
    tx: broadcast::Sender<Envelope>,
    state: Mutex<HubState>,
    config: HubConfig,
}

/// Cheap-to-clone handle to the event hub.
#[derive(Debug, Clone)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

impl EventHub {
    pub fn new(config: HubConfig) -> Self {
        let (tx, _) = broadcast::channel(config.capacity.max(1));
        Self {
            inner: Arc::new(HubInner {
                tx,
                state: Mutex::new(HubState::default()),
                config,
            }),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(HubConfig::default())
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Stamp `event` with the next sequence number and fan it out.
    ///
    /// Sequencing and sending happen under one lock, so every observer sees
    /// events in sequence order.
    pub fn publish(&self, event: ObserverEvent) -> u64 {
        let mut state = self.state();
        let seq = state.next_sequence();
        let timestamp = unix_timestamp();

        if let Some(summary) = event.summary() {
            state.recent.push_back(RecentEvent {
                seq,
                timestamp,
                summary,
            });
            while state.recent.len() > self.inner.config.recent_events {
                state.recent.pop_front();
            }
        }

        let envelope = Envelope {
            seq: Some(seq),
            timestamp,
            event,
        };
        match self.inner.tx.send(envelope) {
            Ok(receivers) => debug!(seq, receivers, "Event broadcast"),
            Err(_) => debug!(seq, "No receivers for broadcast"),
        }
        drop(state);
        seq
    }

    /// Register an observer and open its queue.
    pub fn subscribe(&self, observer_id: &str, kind: &str) -> Result<ObserverHandle, HubError> {
        let mut state = self.state();

        if state.observers.len() >= self.inner.config.max_observers {
            return Err(HubError::TooManyObservers {
                max: self.inner.config.max_observers,
            });
        }
        if state.observers.contains_key(observer_id) {
            return Err(HubError::AlreadyConnected {
                observer_id: observer_id.to_string(),
            });
        }

        state.observers.insert(
            observer_id.to_string(),
            ObserverInfo {
                last_seen: Instant::now(),
            },
        );
        // Subscribing under the lock pins the starting point: the receiver
        // sees exactly the events after `sequence`.
        let events = self.inner.tx.subscribe();
        let sequence = state.sequence;
        drop(state);

        info!(observer_id, kind, "Observer subscribed");
        Ok(ObserverHandle {
            observer_id: observer_id.to_string(),
            events,
            sequence,
        })
    }

    /// Remove an observer. Returns whether it was registered.
    pub fn unsubscribe(&self, observer_id: &str) -> bool {
        let removed = self.state().observers.remove(observer_id).is_some();
        if removed {
            info!(observer_id, "Observer unsubscribed");
        }
        removed
    }

    /// Record that the observer is alive.
    pub fn heartbeat(&self, observer_id: &str) {
        if let Some(observer) = self.state().observers.get_mut(observer_id) {
            observer.last_seen = Instant::now();
        }
    }

    /// Whether the observer has been silent for longer than `timeout`.
    /// Unknown observers count as stale.
    pub fn is_stale(&self, observer_id: &str, timeout: Duration) -> bool {
        self.state()
            .observers
            .get(observer_id)
            .is_none_or(|o| o.last_seen.elapsed() > timeout)
    }

    /// Recent-event tail, oldest first.
    pub fn recent(&self) -> Vec<RecentEvent> {
        self.state().recent.iter().cloned().collect()
    }

    /// Sequence number of the last published event.
    pub fn sequence(&self) -> u64 {
        self.state().sequence
    }

    pub fn stats(&self) -> HubStats {
        let state = self.state();
        HubStats {
            observers: state.observers.len(),
            sequence: state.sequence,
            capacity: self.inner.config.capacity,
        }
    }
}
