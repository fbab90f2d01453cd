//! `SQLite` storage for the Foreman daemon.
//!
//! Provides the feature store (claim/release/complete) and the append-only
//! test-run history.

mod db;
mod models;
mod queries;
mod queries_runs;

pub use db::{Database, DatabaseError};
pub use models::*;
pub use queries_runs::MAX_TEST_RUNS;
