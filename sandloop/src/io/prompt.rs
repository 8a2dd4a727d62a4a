//! System prompt rendering for the coding agent.

use anyhow::Result;
use minijinja::{Environment, context};

use crate::core::conversation::ToolDescriptor;
use crate::core::marker::{SUMMARY_CLOSE, SUMMARY_OPEN};

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("system", SYSTEM_TEMPLATE)
            .expect("system template should be valid");
        Self { env }
    }

    fn render_system(&self, tools: &[ToolDescriptor], preview_port: u16) -> Result<String> {
        let template = self.env.get_template("system")?;
        let rendered = template.render(context! {
            tools => tools,
            preview_port => preview_port,
            summary_open => SUMMARY_OPEN,
            summary_close => SUMMARY_CLOSE,
        })?;
        Ok(rendered)
    }
}

/// Render the fixed agent instructions for the given tool set.
pub fn render_system_prompt(tools: &[ToolDescriptor], preview_port: u16) -> Result<String> {
    PromptEngine::new().render_system(tools, preview_port)
}
