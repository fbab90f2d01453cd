//! Worker report parser.
//!
//! Implements tolerant reader pattern: unknown fields ignored, unknown states
//! kept as [`AgentState::Unknown`], malformed result entries skipped.

use serde_json::Value;

use super::types::{AgentState, FeatureResult, WorkerReport};
use crate::error::{Error, Result};

/// Parse a single NDJSON line from a worker's stdout.
pub fn parse_line(line: &str) -> Result<WorkerReport> {
    let raw: Value = serde_json::from_str(line.trim())?;
    parse_value(&raw)
}

/// Parse a JSON value into a worker report.
pub fn parse_value(raw: &Value) -> Result<WorkerReport> {
    if !raw.is_object() {
        return Err(Error::ReportParse("report is not a JSON object".into()));
    }

    let state = raw
        .get("state")
        .or_else(|| raw.get("status"))
        .and_then(Value::as_str)
        .map(AgentState::parse)
        .ok_or_else(|| Error::ReportParse("Missing 'state' field".into()))?;

    let note = raw
        .get("note")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from);

    let timestamp = raw.get("timestamp").and_then(Value::as_i64);

    Ok(WorkerReport {
        state,
        note,
        timestamp,
        results: parse_results(raw.get("results")),
    })
}

fn parse_results(val: Option<&Value>) -> Option<Vec<FeatureResult>> {
    let arr = val?.as_array()?;
    Some(
        arr.iter()
            .filter_map(|entry| {
                let id = entry.get("id")?.as_i64()?;
                let passes = entry.get("passes")?.as_bool()?;
                Some(FeatureResult { id, passes })
            })
            .collect(),
    )
}
