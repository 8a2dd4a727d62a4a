//! `terminal`: run a shell command in the sandbox.

use anyhow::Result;
use serde::Deserialize;
use serde_json::Value;

use super::{ToolContext, parse_args};
use crate::io::sandbox::{SandboxProvider, SandboxSession};

pub(super) const NAME: &str = "terminal";
pub(super) const DESCRIPTION: &str =
    "Run a shell command in the sandbox working root and return its stdout.";
pub(super) const SCHEMA: &str = include_str!("../../schemas/tools/terminal.schema.json");

#[derive(Debug, Deserialize)]
struct TerminalArgs {
    command: String,
}

pub(super) fn handle<P: SandboxProvider>(
    args: &Value,
    ctx: &mut ToolContext<'_, P>,
) -> Result<String> {
    let args: TerminalArgs = match parse_args(NAME, args) {
        Ok(args) => args,
        Err(message) => return Ok(message),
    };
    let step = ctx.step_name(NAME);
    let sandbox = ctx.sandbox;
    let sandbox_id = ctx.sandbox_id;
    ctx.steps
        .run(&step, || Ok(run_terminal(sandbox, sandbox_id, &args.command)))
}

/// Stdout on success; otherwise a description of the failure with partial output.
fn run_terminal<P: SandboxProvider>(sandbox: &P, sandbox_id: &str, command: &str) -> String {
    let session = match sandbox.connect(sandbox_id) {
        Ok(session) => session,
        Err(err) => return failure(command, &format!("{err:#}"), "", ""),
    };

    let mut stdout = String::new();
    let mut stderr = String::new();
    let result = session.run_command(
        command,
        &mut |chunk| stdout.push_str(chunk),
        &mut |chunk| stderr.push_str(chunk),
    );
    if result.exit.success() {
        stdout
    } else {
        failure(command, &result.exit.describe(), &stdout, &stderr)
    }
}

fn failure(command: &str, reason: &str, stdout: &str, stderr: &str) -> String {
    format!("Command failed: `{command}` ({reason})\nstdout: {stdout}\nstderr: {stderr}")
}
