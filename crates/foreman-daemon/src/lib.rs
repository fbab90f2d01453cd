//! Foreman Daemon Library
//!
//! Core functionality for the Foreman daemon:
//! - SQLite feature store with atomic batch claims and test-run history
//! - Readiness engine, batch scheduler and two-tier worker slots
//! - Worker supervision with stale detection and crash reclaim
//! - Event hub fanning orchestrator state out to observers
//! - HTTP/WebSocket server for observers and operators

pub mod broadcast;
pub mod orchestration;
pub mod server;
pub mod storage;
pub mod subprocess;
