//! Tools exposed to the coding agent.
//!
//! A tool is a fixed table entry: name, description, JSON Schema for its
//! arguments, and a handler. Handlers get an explicit [`ToolContext`] with the
//! step runner, the shared [`RunState`], and the run's sandbox. Anything the
//! agent can get wrong (unknown tool, bad arguments, failing command) comes
//! back as a result string; only step failures abort the run.

mod files;
mod terminal;

use anyhow::{Context, Result};
use jsonschema::Validator;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::conversation::{ToolCallRequest, ToolDescriptor};
use crate::core::types::RunState;
use crate::io::sandbox::SandboxProvider;
use crate::io::schema::{compile_schema, schema_errors};
use crate::step::StepRunner;

pub use files::{ReadOutcome, WriteOutcome};

/// Capabilities handed to a tool handler for one call.
pub struct ToolContext<'a, P: SandboxProvider> {
    pub steps: &'a mut StepRunner,
    pub state: &'a mut RunState,
    pub sandbox: &'a P,
    pub sandbox_id: &'a str,
    /// Step-name prefix for this call, e.g. `iter-2/call-1`.
    pub step_prefix: String,
}

impl<P: SandboxProvider> ToolContext<'_, P> {
    pub fn step_name(&self, tool: &str) -> String {
        format!("{}/{tool}", self.step_prefix)
    }
}

type Handler<P> = fn(&Value, &mut ToolContext<'_, P>) -> Result<String>;

struct ToolSpec<P: SandboxProvider> {
    name: &'static str,
    description: &'static str,
    parameters: Value,
    validator: Validator,
    handler: Handler<P>,
}

/// The tool table offered to the agent.
pub struct Toolbox<P: SandboxProvider> {
    tools: Vec<ToolSpec<P>>,
}

impl<P: SandboxProvider> Toolbox<P> {
    /// `terminal`, `createOrUpdateFiles` and `readFiles`.
    pub fn standard() -> Result<Self> {
        let mut toolbox = Self { tools: Vec::new() };
        toolbox.register(
            terminal::NAME,
            terminal::DESCRIPTION,
            terminal::SCHEMA,
            terminal::handle,
        )?;
        toolbox.register(
            files::WRITE_NAME,
            files::WRITE_DESCRIPTION,
            files::WRITE_SCHEMA,
            files::handle_write,
        )?;
        toolbox.register(
            files::READ_NAME,
            files::READ_DESCRIPTION,
            files::READ_SCHEMA,
            files::handle_read,
        )?;
        Ok(toolbox)
    }

    fn register(
        &mut self,
        name: &'static str,
        description: &'static str,
        schema: &str,
        handler: Handler<P>,
    ) -> Result<()> {
        let parameters: Value =
            serde_json::from_str(schema).with_context(|| format!("parse {name} schema"))?;
        let validator = compile_schema(name, schema)?;
        self.tools.push(ToolSpec {
            name,
            description,
            parameters,
            validator,
            handler,
        });
        Ok(())
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools
            .iter()
            .map(|tool| ToolDescriptor {
                name: tool.name.to_string(),
                description: tool.description.to_string(),
                parameters: tool.parameters.clone(),
            })
            .collect()
    }

    /// Validate and execute one tool call, returning the text fed back to the agent.
    pub fn dispatch(&self, call: &ToolCallRequest, ctx: &mut ToolContext<'_, P>) -> Result<String> {
        let Some(tool) = self.tools.iter().find(|tool| tool.name == call.name) else {
            warn!(tool = %call.name, "unknown tool requested");
            return Ok(format!("Error: unknown tool '{}'", call.name));
        };

        let errors = schema_errors(&tool.validator, &call.arguments);
        if !errors.is_empty() {
            warn!(tool = tool.name, errors = errors.len(), "tool arguments rejected");
            return Ok(format!(
                "Error: invalid arguments for {}: {}",
                tool.name,
                errors.join("; ")
            ));
        }

        debug!(tool = tool.name, step = %ctx.step_prefix, "dispatching tool call");
        (tool.handler)(&call.arguments, ctx)
    }
}

/// Decode validated arguments, mapping a mismatch to a tool-level error string.
fn parse_args<T: DeserializeOwned>(tool: &str, args: &Value) -> Result<T, String> {
    serde_json::from_value(args.clone())
        .map_err(|err| format!("Error: invalid arguments for {tool}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::init::Paths;
    use crate::io::config::SandboxConfig;
    use crate::io::ledger::StepLedger;
    use crate::io::sandbox::{BASE_TEMPLATE, LocalSandboxProvider};
    use crate::step::RetryPolicy;
    use serde_json::json;
    use std::time::Duration;

    fn call(name: &str, arguments: Value) -> ToolCallRequest {
        ToolCallRequest {
            id: "call-1".to_string(),
            name: name.to_string(),
            arguments,
        }
    }

    fn steps() -> StepRunner {
        StepRunner::new(
            StepLedger::in_memory("run-1"),
            RetryPolicy {
                max_attempts: 1,
                backoff_base: Duration::ZERO,
                backoff_max: Duration::ZERO,
            },
        )
    }

    #[test]
    fn descriptors_list_the_three_tools() {
        let toolbox = Toolbox::<LocalSandboxProvider>::standard().expect("toolbox");
        let names: Vec<String> = toolbox.descriptors().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["terminal", "createOrUpdateFiles", "readFiles"]);
    }

    /// Unknown tools and schema violations never reach a handler or the ledger.
    #[test]
    fn rejected_calls_become_error_strings() {
        let temp = tempfile::tempdir().expect("tempdir");
        let provider =
            LocalSandboxProvider::new(&Paths::new(temp.path()), &SandboxConfig::default());
        let sandbox_id = provider.create(BASE_TEMPLATE).expect("create");
        let toolbox = Toolbox::standard().expect("toolbox");
        let mut steps = steps();
        let mut state = RunState::default();
        let mut ctx = ToolContext {
            steps: &mut steps,
            state: &mut state,
            sandbox: &provider,
            sandbox_id: &sandbox_id,
            step_prefix: "iter-1/call-1".to_string(),
        };

        let unknown = toolbox
            .dispatch(&call("deleteFiles", json!({})), &mut ctx)
            .expect("dispatch");
        assert_eq!(unknown, "Error: unknown tool 'deleteFiles'");

        let invalid = toolbox
            .dispatch(&call("terminal", json!({"cmd": "ls"})), &mut ctx)
            .expect("dispatch");
        assert!(invalid.starts_with("Error: invalid arguments for terminal"));
        assert!(ctx.steps.ledger().records().is_empty());
    }
}
