//! Stable exit codes for scheduler CLI commands.
//!
//! Child commands that fail inside the execution pipeline propagate their own
//! exit code instead.

/// Cycle completed, deferred, or skipped because the rotation is saturated.
pub const OK: i32 = 0;
/// Cycle failed: invalid config, prompt rejection, roster exhaustion, memory policy or internal error.
pub const FAILURE: i32 = 1;
/// Lock backend unavailable: preflight failure or lock retries and deferrals exhausted.
pub const LOCK_BACKEND: i32 = 2;
