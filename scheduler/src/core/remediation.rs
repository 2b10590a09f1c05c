//! Operator remediation text appended to lock backend failure records.

/// Runbook covering relay outages during lock acquisition.
pub const RELAY_RUNBOOK: &str = "docs/agent-handoffs/learnings/2026-02-15-relay-health-preflight-job.md";

/// Build the remediation paragraph: retry window and budget, the command to
/// retry, the health check to run first, and the runbook.
pub fn remediation_text(
    retry_command: &str,
    health_command: &str,
    retry_window_minutes: i64,
    max_deferrals: u32,
) -> String {
    format!(
        "Recommended auto-remediation: Likely backend/relay connectivity issue during lock acquisition. \
Retry window: {retry_window_minutes} minute(s) (max deferrals: {max_deferrals}). \
Retry command: {retry_command}. \
Run health check: {health_command}. \
Review incident runbook: {RELAY_RUNBOOK}"
    )
}
