//! Orchestration of one run: trigger handling, the sandbox step, the agent
//! loop, and finalization, re-drivable from the step ledger.
//!
//! A run is identified by a stable `run_id` and owns
//! `.sandloop/runs/<run-id>/` (`run.json`, `steps.json`, `iterations/`).
//! Starting a run whose id already exists continues it; nothing that already
//! completed is executed twice.

use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use jsonschema::Validator;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::core::types::RunState;
use crate::finalize::{FinalizeRequest, RunResult, finalize};
use crate::io::config::Config;
use crate::io::init::{Paths, validate_id};
use crate::io::iteration_log::write_turn_log;
use crate::io::ledger::StepLedger;
use crate::io::model::Model;
use crate::io::prompt::render_system_prompt;
use crate::io::run_record::{RunRecord, load_run_record, write_run_record};
use crate::io::sandbox::SandboxProvider;
use crate::io::schema::{compile_schema, ensure_valid};
use crate::io::store::ResultStore;
use crate::looping::{CancelToken, LoopRequest, run_agent_loop};
use crate::step::{RetryPolicy, RunFailed, StepRunner};
use crate::tools::Toolbox;

/// Event name that starts a run.
pub const RUN_EVENT_NAME: &str = "code-agent/run";

const RUN_EVENT_SCHEMA: &str = include_str!("../schemas/run_event.schema.json");

static RUN_EVENT_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    compile_schema("run event", RUN_EVENT_SCHEMA).expect("bundled run event schema is valid")
});

/// Trigger event: `{"name": "code-agent/run", "data": {"taskInput": "..."}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEvent {
    pub name: String,
    pub data: RunEventData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEventData {
    #[serde(rename = "taskInput")]
    pub task_input: String,
}

impl RunEvent {
    pub fn new(task_input: &str) -> Self {
        Self {
            name: RUN_EVENT_NAME.to_string(),
            data: RunEventData {
                task_input: task_input.to_string(),
            },
        }
    }
}

/// Parse and validate a trigger event.
pub fn parse_event(raw: &str) -> Result<RunEvent> {
    let value: Value = serde_json::from_str(raw).context("parse run event json")?;
    ensure_valid("run event", &RUN_EVENT_VALIDATOR, &value)?;
    serde_json::from_value(value).context("decode run event")
}

/// Collaborators and settings shared by every run in a workspace.
pub struct Runtime<'a, M, P, R> {
    pub paths: &'a Paths,
    pub config: &'a Config,
    pub model: &'a M,
    pub sandbox: &'a P,
    pub store: &'a R,
    pub cancel: &'a CancelToken,
}

/// Start the run an event asks for.
pub fn handle_event<M: Model, P: SandboxProvider, R: ResultStore>(
    rt: &Runtime<'_, M, P, R>,
    event: &RunEvent,
    run_id: Option<&str>,
) -> Result<RunResult> {
    if event.name != RUN_EVENT_NAME {
        return Err(anyhow!(
            "unsupported event '{}' (expected '{RUN_EVENT_NAME}')",
            event.name
        ));
    }
    start_run(rt, &event.data.task_input, run_id)
}

/// Start a run for `task_input`.
///
/// With an explicit `run_id` that already exists, the run is continued as long
/// as the task matches; a different task under the same id is rejected.
#[instrument(skip_all, fields(run_id = ?run_id))]
pub fn start_run<M: Model, P: SandboxProvider, R: ResultStore>(
    rt: &Runtime<'_, M, P, R>,
    task_input: &str,
    run_id: Option<&str>,
) -> Result<RunResult> {
    if task_input.trim().is_empty() {
        return Err(anyhow!("task input must not be empty"));
    }
    let run_id = match run_id {
        Some(id) => {
            validate_id(id).context("invalid run id")?;
            id.to_string()
        }
        None => generate_run_id(),
    };

    let record_path = rt.paths.run_record_path(&run_id);
    let record = if record_path.exists() {
        let record = load_run_record(&record_path)?;
        if record.task_input != task_input {
            return Err(anyhow!(
                "run '{run_id}' already exists with a different task (use `resume` to continue it)"
            ));
        }
        info!(run_id = %run_id, "continuing existing run");
        record
    } else {
        let mut record = RunRecord::new(&run_id, task_input);
        write_run_record(&record_path, &mut record)?;
        info!(run_id = %run_id, "run started");
        record
    };
    drive(rt, record, false)
}

/// Re-drive an existing run from its ledger.
///
/// With `retry_failed`, steps that exhausted their retries are re-armed first.
#[instrument(skip_all, fields(run_id = %run_id, retry_failed = retry_failed))]
pub fn resume_run<M: Model, P: SandboxProvider, R: ResultStore>(
    rt: &Runtime<'_, M, P, R>,
    run_id: &str,
    retry_failed: bool,
) -> Result<RunResult> {
    validate_id(run_id).context("invalid run id")?;
    let record_path = rt.paths.run_record_path(run_id);
    if !record_path.exists() {
        return Err(anyhow!("run '{run_id}' not found"));
    }
    let record = load_run_record(&record_path)?;
    drive(rt, record, retry_failed)
}

fn drive<M: Model, P: SandboxProvider, R: ResultStore>(
    rt: &Runtime<'_, M, P, R>,
    mut record: RunRecord,
    retry_failed: bool,
) -> Result<RunResult> {
    let run_id = record.run_id.clone();
    let mut ledger = StepLedger::open(&run_id, &rt.paths.ledger_path(&run_id))?;
    if retry_failed {
        let cleared = ledger.clear_failed()?;
        info!(run_id = %run_id, cleared, "re-armed failed steps");
        record.failure = None;
    }
    let mut steps = StepRunner::new(ledger, RetryPolicy::from(&rt.config.steps));

    match drive_steps(rt, &mut steps, &mut record) {
        Ok(result) => Ok(result),
        Err(err) => {
            if let Some(failed) = err.downcast_ref::<RunFailed>() {
                error!(
                    run_id = %run_id,
                    step = %failed.step,
                    attempts = failed.attempts,
                    err = %failed.message,
                    "run failed"
                );
                record.failure = Some(failed.to_string());
                write_run_record(&rt.paths.run_record_path(&run_id), &mut record)?;
            }
            Err(err)
        }
    }
}

fn drive_steps<M: Model, P: SandboxProvider, R: ResultStore>(
    rt: &Runtime<'_, M, P, R>,
    steps: &mut StepRunner,
    record: &mut RunRecord,
) -> Result<RunResult> {
    let record_path = rt.paths.run_record_path(&record.run_id);

    let sandbox_id: String =
        steps.run("get-sandbox-id", || rt.sandbox.create(&rt.config.sandbox_template))?;
    if record.sandbox_id.as_deref() != Some(sandbox_id.as_str()) {
        record.sandbox_id = Some(sandbox_id.clone());
        write_run_record(&record_path, record)?;
    }
    debug!(run_id = %record.run_id, sandbox_id = %sandbox_id, "sandbox ready");

    let toolbox = Toolbox::standard()?;
    let system_prompt = render_system_prompt(&toolbox.descriptors(), rt.config.preview_port)?;
    let iterations_dir = rt.paths.iterations_dir(&record.run_id);
    let task_input = record.task_input.clone();

    let mut state = RunState::default();
    let outcome = run_agent_loop(
        steps,
        &mut state,
        rt.model,
        rt.sandbox,
        &toolbox,
        &LoopRequest {
            task_input: &task_input,
            system_prompt: &system_prompt,
            sandbox_id: &sandbox_id,
            max_iterations: rt.config.max_iterations,
        },
        rt.cancel,
        |turn| {
            write_turn_log(&iterations_dir, turn)?;
            record.iterations = turn.iter;
            write_run_record(&record_path, record)
        },
    )?;
    record.stop = Some(outcome.stop);
    write_run_record(&record_path, record)?;

    let result = finalize(
        steps,
        &state,
        rt.sandbox,
        rt.store,
        &FinalizeRequest {
            sandbox_id: &sandbox_id,
            preview_port: rt.config.preview_port,
            title: &rt.config.fragment_title,
        },
    )?;
    record.outcome = result.outcome;
    record.failure = None;
    write_run_record(&record_path, record)?;
    Ok(result)
}

fn generate_run_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("run-{}-{}", Utc::now().format("%Y%m%d-%H%M%S"), &suffix[..8])
}
