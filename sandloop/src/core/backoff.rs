//! Retry delay computation for failed steps.

use std::time::Duration;

/// Exponential backoff delay before retry number `attempt` (1-indexed).
///
/// Returns `base * 2^(attempt - 1)`, capped at `max`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exponent).min(max)
}
