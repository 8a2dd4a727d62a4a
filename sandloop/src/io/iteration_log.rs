//! Per-iteration logs under `.sandloop/runs/<run-id>/iterations/<n>/`.

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::write_json_atomic;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallLog {
    pub id: String,
    pub name: String,
    pub arguments: Value,
    pub result: String,
}

/// What happened during one agent turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnLog {
    pub run_id: String,
    pub iter: u32,
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCallLog>,
    /// True when this turn's output set the run summary.
    pub summary_recorded: bool,
}

pub fn turn_log_path(iterations_dir: &Path, iter: u32) -> PathBuf {
    iterations_dir.join(iter.to_string()).join("turn.json")
}

/// Write the turn log, replacing one left by an earlier drive of the same run.
pub fn write_turn_log(iterations_dir: &Path, log: &TurnLog) -> Result<PathBuf> {
    let path = turn_log_path(iterations_dir, log.iter);
    write_json_atomic(&path, log)?;
    Ok(path)
}
