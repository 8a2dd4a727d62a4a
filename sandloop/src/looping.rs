//! The agent loop: invoke the model, dispatch its tool calls, detect completion,
//! and let the router decide whether to go again.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, anyhow};
use tracing::{debug, info};

use crate::core::conversation::{Completion, Conversation};
use crate::core::marker::extract_summary;
use crate::core::router::LoopState;
use crate::core::types::{LoopStop, RunState};
use crate::io::iteration_log::{ToolCallLog, TurnLog};
use crate::io::model::{CompletionRequest, Model};
use crate::io::sandbox::SandboxProvider;
use crate::step::StepRunner;
use crate::tools::{ToolContext, Toolbox};

/// Step recording why the loop terminated.
pub const LOOP_STOP_STEP: &str = "loop-stop";

/// Shared flag that stops the loop before its next agent invocation.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Fixed inputs of one loop invocation.
#[derive(Debug, Clone)]
pub struct LoopRequest<'a> {
    pub task_input: &'a str,
    pub system_prompt: &'a str,
    pub sandbox_id: &'a str,
    pub max_iterations: u32,
}

/// How the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopOutcome {
    /// Agent invocations performed (replayed ones included).
    pub iterations: u32,
    pub stop: LoopStop,
}

/// Drive the agent until the router stops it, the iteration bound is hit, or
/// `cancel` fires.
///
/// Agent turns run as steps `iter-<n>/agent` and tool calls as
/// `iter-<n>/call-<k>/<tool>`, so a re-driven run rebuilds the conversation and
/// `state` from the ledger without invoking the model or sandbox again.
/// The terminal decision is recorded as step [`LOOP_STOP_STEP`]; once it exists,
/// a re-drive replays the recorded turns and stops with the recorded reason
/// instead of invoking the model again, whatever the current bound or token.
/// `on_iteration` sees each finished turn; an error from it aborts the loop.
#[allow(clippy::too_many_arguments)]
pub fn run_agent_loop<M, P, F>(
    steps: &mut StepRunner,
    state: &mut RunState,
    model: &M,
    sandbox: &P,
    toolbox: &Toolbox<P>,
    request: &LoopRequest<'_>,
    cancel: &CancelToken,
    mut on_iteration: F,
) -> Result<LoopOutcome>
where
    M: Model,
    P: SandboxProvider,
    F: FnMut(&TurnLog) -> Result<()>,
{
    let tools = toolbox.descriptors();
    let mut conversation = Conversation::new(request.task_input);
    let mut loop_state = LoopState::start();
    let mut iterations = 0u32;

    let recorded_stop: Option<LoopStop> = if steps.ledger().get(LOOP_STOP_STEP).is_some() {
        Some(steps.run(LOOP_STOP_STEP, || Err(anyhow!("loop stop was not recorded")))?)
    } else {
        None
    };
    let max_iterations = match recorded_stop {
        Some(_) => u32::MAX,
        None => request.max_iterations,
    };

    loop {
        let completed = match loop_state {
            LoopState::Terminated(stop) => {
                let stop: LoopStop = steps.run(LOOP_STOP_STEP, || Ok(stop))?;
                info!(run_id = %steps.run_id(), iterations, stop = ?stop, "agent loop terminated");
                return Ok(LoopOutcome { iterations, stop });
            }
            LoopState::Running { completed } => completed,
        };

        let iter = completed + 1;
        let agent_step = format!("iter-{iter}/agent");
        if steps.ledger().get(&agent_step).is_none() {
            if let Some(stop) = recorded_stop {
                loop_state = LoopState::Terminated(stop);
                continue;
            }
            if cancel.is_cancelled() {
                info!(run_id = %steps.run_id(), iterations, "agent loop cancelled");
                loop_state = loop_state.cancel();
                continue;
            }
        }

        debug!(run_id = %steps.run_id(), iter, "agent turn");
        let completion: Completion = steps.run(&agent_step, || {
            model.complete(&CompletionRequest {
                system: request.system_prompt.to_string(),
                tools: tools.clone(),
                messages: conversation.messages().to_vec(),
            })
        })?;
        iterations = iter;
        conversation.push_completion(&completion);

        let mut call_logs = Vec::with_capacity(completion.tool_calls.len());
        for (idx, call) in completion.tool_calls.iter().enumerate() {
            let mut ctx = ToolContext {
                steps: &mut *steps,
                state: &mut *state,
                sandbox,
                sandbox_id: request.sandbox_id,
                step_prefix: format!("iter-{iter}/call-{}", idx + 1),
            };
            let result = toolbox.dispatch(call, &mut ctx)?;
            conversation.push_tool_result(call, &result);
            call_logs.push(ToolCallLog {
                id: call.id.clone(),
                name: call.name.clone(),
                arguments: call.arguments.clone(),
                result,
            });
        }

        // Completion hook: only the first marker ever sets the summary.
        let summary_recorded = completion
            .text
            .as_deref()
            .and_then(extract_summary)
            .is_some_and(|summary| state.record_summary(summary));
        if summary_recorded {
            info!(run_id = %steps.run_id(), iter, "completion marker detected");
        }

        on_iteration(&TurnLog {
            run_id: steps.run_id().to_string(),
            iter,
            text: completion.text.clone(),
            tool_calls: call_logs,
            summary_recorded,
        })?;

        loop_state = loop_state.advance(state, max_iterations);
    }
}
