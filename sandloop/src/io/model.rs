//! Text-completion backends.
//!
//! The [`Model`] trait decouples the agent loop from the backend producing
//! completions. [`CommandModel`] speaks a small JSON protocol with an external
//! command; tests use scripted models that replay canned completions.

use std::path::PathBuf;
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use jsonschema::Validator;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::config::ModelConfig;
use super::process::run_command_with_timeout;
use super::schema::{compile_schema, ensure_valid};
use crate::core::conversation::{Completion, Message, ToolDescriptor};

const COMPLETION_SCHEMA: &str = include_str!("../../schemas/completion.schema.json");

static COMPLETION_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    compile_schema("completion", COMPLETION_SCHEMA).expect("bundled completion schema is valid")
});

/// Everything the model sees for one agent invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub system: String,
    pub tools: Vec<ToolDescriptor>,
    pub messages: Vec<Message>,
}

/// A text-completion / tool-calling capability.
pub trait Model {
    fn complete(&self, request: &CompletionRequest) -> Result<Completion>;
}

/// Model backed by an external command.
///
/// The request is written to the command's stdin as JSON; the command must
/// print one completion object (see `schemas/completion.schema.json`) on stdout.
pub struct CommandModel {
    program: String,
    args: Vec<String>,
    workdir: PathBuf,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandModel {
    pub fn new(config: &ModelConfig, workdir: impl Into<PathBuf>) -> Result<Self> {
        let (program, args) = config
            .command
            .split_first()
            .ok_or_else(|| anyhow!("model.command must not be empty"))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            workdir: workdir.into(),
            timeout: Duration::from_secs(config.timeout_secs),
            output_limit_bytes: config.output_limit_bytes,
        })
    }
}

impl Model for CommandModel {
    #[instrument(skip_all, fields(program = %self.program, messages = request.messages.len()))]
    fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let input = serde_json::to_vec(request).context("serialize completion request")?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).current_dir(&self.workdir);
        let output =
            run_command_with_timeout(cmd, Some(&input), self.timeout, self.output_limit_bytes)
                .with_context(|| format!("run model command '{}'", self.program))?;

        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "model command timed out");
            return Err(anyhow!("model command timed out after {:?}", self.timeout));
        }
        if !output.status.success() {
            let stderr = output.stderr_lossy();
            warn!(exit_code = ?output.status.code(), "model command failed");
            return Err(anyhow!(
                "model command failed with status {:?}: {}",
                output.status.code(),
                stderr.trim()
            ));
        }
        if output.stdout_truncated > 0 {
            return Err(anyhow!(
                "model output exceeded {} bytes",
                self.output_limit_bytes
            ));
        }

        let completion = parse_completion(&output.stdout_lossy())?;
        debug!(
            has_text = completion.text.is_some(),
            tool_calls = completion.tool_calls.len(),
            "completion received"
        );
        Ok(completion)
    }
}

/// Parse and validate a completion printed by a model backend.
pub fn parse_completion(raw: &str) -> Result<Completion> {
    let value: Value = serde_json::from_str(raw.trim()).context("parse completion json")?;
    ensure_valid("completion", &COMPLETION_VALIDATOR, &value)?;
    serde_json::from_value(value).context("decode completion")
}
