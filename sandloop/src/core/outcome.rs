//! Success/error classification applied at finalization.

use crate::core::types::{Outcome, RunState};

/// Classify a terminated run.
///
/// A run is an `Error` when no summary was recorded or no file was produced,
/// even if the agent reported completion.
pub fn classify(state: &RunState) -> Outcome {
    if state.summary.is_none() || state.files.is_empty() {
        Outcome::Error
    } else {
        Outcome::Success
    }
}
