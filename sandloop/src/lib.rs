//! Durable coding-agent orchestration loop.
//!
//! A run provisions one sandbox, drives a tool-calling model through bounded
//! iterations against it, and persists a single classified result. Every
//! side-effecting unit is a named step in a per-run ledger, so a run can be
//! re-driven after a crash without repeating completed work.
//!
//! - **[`core`]**: Pure, deterministic logic (router, completion marker,
//!   classification, conversation types). No I/O.
//! - **[`io`]**: Side effects (ledger and record files, processes, sandboxes,
//!   model backends, result storage).
//!
//! Orchestration modules ([`step`], [`tools`], [`looping`], [`finalize`],
//! [`run`]) combine the two to implement the CLI commands.

pub mod core;
pub mod exit_codes;
pub mod finalize;
pub mod io;
pub mod logging;
pub mod looping;
pub mod run;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tools;
