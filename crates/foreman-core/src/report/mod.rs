//! Worker report protocol.
//!
//! Workers print newline-delimited JSON on stdout. This module maps each line
//! onto a [`WorkerReport`], implementing a tolerant reader: unknown fields are
//! ignored and unknown states become [`AgentState::Unknown`].

mod parser;
mod types;

pub use parser::{parse_line, parse_value};
pub use types::*;
