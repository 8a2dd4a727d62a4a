//! Result finalization: resolve the preview URL, classify, persist once.

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::outcome::classify;
use crate::core::types::{FileMap, Outcome, RunState};
use crate::io::sandbox::{SandboxProvider, SandboxSession};
use crate::io::store::{Fragment, RecordKind, ResultRecord, ResultStore, Role};
use crate::step::StepRunner;

/// Content persisted for runs that finish without a usable result.
pub const GENERIC_FAILURE: &str = "Something went wrong. Please try again.";

/// What the caller gets back, on both the success and the error path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    pub url: String,
    pub title: String,
    pub files: FileMap,
    pub summary: Option<String>,
    pub outcome: Outcome,
}

#[derive(Debug, Clone)]
pub struct FinalizeRequest<'a> {
    pub sandbox_id: &'a str,
    pub preview_port: u16,
    pub title: &'a str,
}

/// Run the `get-sandbox-url` and `save-result` steps for a terminated loop.
pub fn finalize<P: SandboxProvider, R: ResultStore>(
    steps: &mut StepRunner,
    state: &RunState,
    sandbox: &P,
    store: &R,
    request: &FinalizeRequest<'_>,
) -> Result<RunResult> {
    let url: String = steps.run("get-sandbox-url", || {
        sandbox
            .connect(request.sandbox_id)?
            .resolve_host(request.preview_port)
    })?;

    let outcome = classify(state);
    let run_id = steps.run_id().to_string();
    let record = build_record(&run_id, state, outcome, &url, request.title);
    steps.run("save-result", || store.create(&record))?;

    info!(run_id = %run_id, outcome = ?outcome, url = %url, "run finalized");
    Ok(RunResult {
        run_id,
        url,
        title: request.title.to_string(),
        files: state.files.clone(),
        summary: state.summary.clone(),
        outcome,
    })
}

/// The single record persisted for a run with the given classification.
pub fn build_record(
    run_id: &str,
    state: &RunState,
    outcome: Outcome,
    url: &str,
    title: &str,
) -> ResultRecord {
    let (content, kind, fragment) = match (outcome, &state.summary) {
        (Outcome::Success, Some(summary)) => (
            summary.clone(),
            RecordKind::Result,
            Some(Fragment {
                sandbox_url: url.to_string(),
                title: title.to_string(),
                files: state.files.clone(),
            }),
        ),
        _ => (GENERIC_FAILURE.to_string(), RecordKind::Error, None),
    };
    ResultRecord {
        run_id: run_id.to_string(),
        content,
        role: Role::Assistant,
        kind,
        fragment,
        created_at: Utc::now(),
    }
}
