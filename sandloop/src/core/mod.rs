//! Deterministic, pure logic shared by the orchestration loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod backoff;
pub mod conversation;
pub mod marker;
pub mod outcome;
pub mod path;
pub mod router;
pub mod types;
