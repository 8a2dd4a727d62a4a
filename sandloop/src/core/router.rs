//! Router policy and the two-state loop machine.
//!
//! The router is a pure decision over [`RunState`]; [`LoopState`] tracks how
//! many agent invocations have completed and absorbs into `Terminated`.

use crate::core::types::{LoopStop, RunState};

/// Router decision after an agent turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Re-invoke the same agent.
    Continue,
    /// No next agent.
    Stop,
}

/// Decide whether the agent runs again.
pub fn route(state: &RunState) -> Route {
    if state.summary.is_some() {
        Route::Stop
    } else {
        Route::Continue
    }
}

/// Agent loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// `completed` agent invocations have finished so far.
    Running { completed: u32 },
    /// Terminal and absorbing.
    Terminated(LoopStop),
}

impl LoopState {
    pub fn start() -> Self {
        LoopState::Running { completed: 0 }
    }

    /// Transition after one more agent invocation has finished.
    pub fn advance(self, state: &RunState, max_iterations: u32) -> Self {
        let LoopState::Running { completed } = self else {
            return self;
        };
        let completed = completed + 1;
        if route(state) == Route::Stop {
            return LoopState::Terminated(LoopStop::Completed);
        }
        if completed >= max_iterations {
            return LoopState::Terminated(LoopStop::IterationLimit { max_iterations });
        }
        LoopState::Running { completed }
    }

    /// Transition on cancellation. Already-terminated states are kept.
    pub fn cancel(self) -> Self {
        match self {
            LoopState::Running { .. } => LoopState::Terminated(LoopStop::Cancelled),
            terminated => terminated,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, LoopState::Running { .. })
    }
}
