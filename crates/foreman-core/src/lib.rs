//! Foreman Core Library
//!
//! Shared functionality for Foreman components:
//! - Feature backlog model and counters
//! - Worker lifecycle states and tolerant report parsing
//! - Configuration resolution and hierarchy
//! - `SQLite` pool helpers and tracing initialisation
//! - Common error types

pub mod config;
pub mod db;
pub mod error;
pub mod feature;
pub mod report;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
pub use feature::{DEFAULT_PRIORITY, Feature, FeatureId, FeatureStats, NewFeature};
pub use report::{AgentState, FeatureResult, WorkerClass, WorkerReport};
