//! Result persistence: exactly one outcome record per run.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::core::types::FileMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Result,
    Error,
}

/// Bundle attached to a successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub sandbox_url: String,
    pub title: String,
    pub files: FileMap,
}

/// Persisted outcome of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub run_id: String,
    pub content: String,
    pub role: Role,
    #[serde(rename = "type")]
    pub kind: RecordKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragment: Option<Fragment>,
    pub created_at: DateTime<Utc>,
}

/// Destination for result records.
pub trait ResultStore {
    fn create(&self, record: &ResultRecord) -> Result<()>;
}

/// Appends one JSON line per record to `.sandloop/results.jsonl`.
#[derive(Debug, Clone)]
pub struct JsonlResultStore {
    path: PathBuf,
}

impl JsonlResultStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every record in the file, oldest first. A missing file holds none.
    pub fn load_all(&self) -> Result<Vec<ResultRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read results {}", self.path.display()))?;
        contents
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                serde_json::from_str(line).with_context(|| {
                    format!("parse results {} line {}", self.path.display(), idx + 1)
                })
            })
            .collect()
    }
}

impl ResultStore for JsonlResultStore {
    #[instrument(skip_all, fields(run_id = %record.run_id))]
    fn create(&self, record: &ResultRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut line = serde_json::to_string(record).context("serialize result record")?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open results {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append results {}", self.path.display()))?;
        debug!(path = %self.path.display(), "result record appended");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(run_id: &str, kind: RecordKind) -> ResultRecord {
        ResultRecord {
            run_id: run_id.to_string(),
            content: "content".to_string(),
            role: Role::Assistant,
            kind,
            fragment: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn record_serializes_type_field() {
        let value = serde_json::to_value(record("run-1", RecordKind::Error)).expect("json");
        assert_eq!(value["type"], json!("error"));
        assert_eq!(value["role"], json!("assistant"));
        assert!(value.get("fragment").is_none());
    }

    #[test]
    fn jsonl_store_appends_records() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = JsonlResultStore::new(temp.path().join("nested/results.jsonl"));
        assert!(store.load_all().expect("empty").is_empty());

        let mut success = record("run-1", RecordKind::Result);
        success.fragment = Some(Fragment {
            sandbox_url: "https://3000-sbx.localhost".to_string(),
            title: "Fragment".to_string(),
            files: FileMap::from([("a.txt".to_string(), "x".to_string())]),
        });
        store.create(&success).expect("first");
        store.create(&record("run-2", RecordKind::Error)).expect("second");

        let loaded = store.load_all().expect("load");
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0], success);
        assert_eq!(loaded[1].kind, RecordKind::Error);
    }
}
