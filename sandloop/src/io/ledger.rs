//! Persisted step ledger for one run (`.sandloop/runs/<run-id>/steps.json`).
//!
//! The ledger maps a step name to its recorded result. It is rewritten
//! atomically after every new record, so a crash leaves either the previous
//! or the next ledger on disk, never a torn one.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::write_json_atomic;

/// What a step left behind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepStatus {
    /// The body succeeded; `output` is replayed instead of re-running it.
    Completed { output: Value },
    /// Every attempt failed; replays reproduce the failure.
    Failed { error: String },
    /// A durable sleep that ends at `wake_at`.
    Sleeping { wake_at: DateTime<Utc> },
}

/// One ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    #[serde(flatten)]
    pub status: StepStatus,
    /// Attempts consumed before the record was written.
    pub attempts: u32,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LedgerFile {
    run_id: String,
    steps: Vec<StepRecord>,
}

/// Step records of a single run, in the order they were first recorded.
#[derive(Debug)]
pub struct StepLedger {
    run_id: String,
    path: Option<PathBuf>,
    records: Vec<StepRecord>,
}

impl StepLedger {
    /// Open the ledger at `path`, starting empty if the file does not exist yet.
    pub fn open(run_id: &str, path: &Path) -> Result<Self> {
        let records = if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("read step ledger {}", path.display()))?;
            let file: LedgerFile = serde_json::from_str(&contents)
                .with_context(|| format!("parse step ledger {}", path.display()))?;
            if file.run_id != run_id {
                return Err(anyhow!(
                    "step ledger {} belongs to run '{}', not '{run_id}'",
                    path.display(),
                    file.run_id
                ));
            }
            file.steps
        } else {
            Vec::new()
        };
        debug!(run_id, steps = records.len(), path = %path.display(), "step ledger opened");
        Ok(Self {
            run_id: run_id.to_string(),
            path: Some(path.to_path_buf()),
            records,
        })
    }

    /// A ledger that is never written to disk.
    pub fn in_memory(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            path: None,
            records: Vec::new(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn records(&self) -> &[StepRecord] {
        &self.records
    }

    pub fn get(&self, name: &str) -> Option<&StepRecord> {
        self.records.iter().find(|record| record.name == name)
    }

    /// Insert or replace the record for `record.name`, then persist.
    pub fn record(&mut self, record: StepRecord) -> Result<()> {
        match self.records.iter_mut().find(|r| r.name == record.name) {
            Some(existing) => *existing = record,
            None => self.records.push(record),
        }
        self.flush()
    }

    /// Drop every `Failed` record so those steps run again on the next drive.
    ///
    /// Returns the number of records removed.
    pub fn clear_failed(&mut self) -> Result<usize> {
        let before = self.records.len();
        self.records
            .retain(|record| !matches!(record.status, StepStatus::Failed { .. }));
        let removed = before - self.records.len();
        if removed > 0 {
            self.flush()?;
        }
        Ok(removed)
    }

    fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = LedgerFile {
            run_id: self.run_id.clone(),
            steps: self.records.clone(),
        };
        write_json_atomic(path, &file)
            .with_context(|| format!("write step ledger {}", path.display()))
    }
}
