//! Operator tracing for the scheduler.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted, not part of scheduler product output.
//!
//! - **Task logs (`io/task_log`)**: Audit records in `<log_root>/<cadence>/`.
//!   Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter: scheduler events at info (lock retries, exclusions), everything else at warn.
const DEFAULT_FILTER: &str = "scheduler=info,warn";

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=scheduler=debug scheduler run daily
/// ```
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
