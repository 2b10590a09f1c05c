//! Rotating agent scheduler with relay-backed lock coordination.
//!
//! Independent scheduler invocations take turns running a roster of agents.
//! Mutual exclusion is delegated to an external, eventually consistent lock
//! backend reached through opaque commands. The architecture enforces a strict
//! separation:
//!
//! - **[`core`]**: Pure, deterministic logic (classification, exclusion,
//!   selection, deferral decisions). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (config, child processes, the lock
//!   backend, task logs, run state). Isolated behind traits for scripted tests.
//!
//! Orchestration modules ([`cycle`], [`pipeline`], [`select`]) coordinate core
//! logic with I/O to implement CLI commands.

pub mod core;
pub mod cycle;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod pipeline;
pub mod select;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
