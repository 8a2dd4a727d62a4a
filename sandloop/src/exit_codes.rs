//! Stable exit codes for sandloop CLI commands.

/// Command succeeded; for runs, the outcome is `success`.
pub const OK: i32 = 0;
/// Invalid input, layout or config, or any other error.
pub const INVALID: i32 = 1;
/// The run finished with an `error` outcome.
pub const RUN_ERROR: i32 = 2;
/// A step exhausted its retries and the run could not finish.
pub const RUN_FAILED: i32 = 3;
