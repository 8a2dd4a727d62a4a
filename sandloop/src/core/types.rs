//! Shared deterministic types for the orchestration core.
//!
//! These types are serialized into step records and run records, so their
//! JSON shape must stay stable across releases.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Files produced by the agent, keyed by path relative to the sandbox root.
///
/// A `BTreeMap` keeps serialized output ordered by path.
pub type FileMap = BTreeMap<String, String>;

/// A single file exchanged with the file tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub content: String,
}

/// Mutable state shared by tool handlers and the completion hook of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    /// Every file the agent created or updated. Keys are never removed.
    pub files: FileMap,
    /// Completion summary. Set at most once; its presence stops the loop.
    pub summary: Option<String>,
}

impl RunState {
    /// Merge freshly written files, overwriting existing paths.
    pub fn merge_files(&mut self, written: FileMap) {
        self.files.extend(written);
    }

    /// Record the completion summary unless one is already present.
    ///
    /// Returns `true` when this call set the summary.
    pub fn record_summary(&mut self, summary: String) -> bool {
        if self.summary.is_some() {
            return false;
        }
        self.summary = Some(summary);
        true
    }
}

/// Final classification of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    #[default]
    Pending,
    Success,
    Error,
}

/// Reason the agent loop entered its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum LoopStop {
    /// The router saw a completion summary.
    Completed,
    /// The agent was invoked `max_iterations` times without a summary.
    IterationLimit { max_iterations: u32 },
    /// The cancellation token fired before the next agent invocation.
    Cancelled,
}
