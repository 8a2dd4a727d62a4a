//! Per-run bookkeeping (`.sandloop/runs/<run-id>/run.json`).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::write_json_atomic;
use crate::core::types::{LoopStop, Outcome};

/// Snapshot of a run's progress. Diagnostic only: the step ledger is the
/// source of truth on resume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub task_input: String,
    pub sandbox_id: Option<String>,
    /// Agent invocations completed so far.
    pub iterations: u32,
    pub outcome: Outcome,
    pub stop: Option<LoopStop>,
    /// Set when a step exhausted its retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn new(run_id: &str, task_input: &str) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.to_string(),
            task_input: task_input.to_string(),
            sandbox_id: None,
            iterations: 0,
            outcome: Outcome::Pending,
            stop: None,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }
}

pub fn load_run_record(path: &Path) -> Result<RunRecord> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read run record {}", path.display()))?;
    let record: RunRecord = serde_json::from_str(&contents)
        .with_context(|| format!("parse run record {}", path.display()))?;
    debug!(run_id = %record.run_id, iterations = record.iterations, "run record loaded");
    Ok(record)
}

/// Stamp `updated_at` and atomically rewrite the record.
pub fn write_run_record(path: &Path, record: &mut RunRecord) -> Result<()> {
    record.updated_at = Utc::now();
    debug!(
        path = %path.display(),
        run_id = %record.run_id,
        iterations = record.iterations,
        "writing run record"
    );
    write_json_atomic(path, record)
}
