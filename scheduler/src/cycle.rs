//! Orchestration for a single `scheduler run <cadence>` cycle.
//!
//! Preflight → exclusion → selection → lock acquisition (deferral on backend
//! failure) → execution pipeline → one terminal task log.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::core::classifier::{BackendCategory, classify_backend_error};
use crate::core::deferral::{DeferralDecision, DeferralKind, decide_backend_failure, idempotency_key};
use crate::core::events::{HealthReport, summarize_lock_failure_reasons};
use crate::core::exclusion::merge;
use crate::core::redact::{excerpt, redact};
use crate::core::remediation::remediation_text;
use crate::core::types::{BACKEND_UNAVAILABLE, FailureCategory, LogStatus, run_date};
use crate::exit_codes;
use crate::io::backend::{LockBackend, diagnostic_events, structured_payload};
use crate::io::config::SchedulerConfig;
use crate::io::lock::{LockAttempt, LockExit, LockRequest, Sleeper, acquire_with_retry};
use crate::io::memory::read_learnings;
use crate::io::process::{CommandOutput, CommandRunner};
use crate::io::run_state::RunStateStore;
use crate::io::task_log::{TaskLogDir, TaskLogRecord};
use crate::pipeline::{AgentIdentity, run_pipeline};
use crate::select::resolve_rotation;

/// Agent recorded on task logs written before any agent was selected.
pub const SCHEDULER_AGENT: &str = "scheduler";

/// Wall clock, injectable for tests.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Collaborators for one cycle.
pub struct CycleDeps<'a, R, B, S, C> {
    pub runner: &'a R,
    pub backend: &'a B,
    pub sleeper: &'a S,
    pub clock: &'a C,
}

/// How the cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStatus {
    Completed,
    Failed,
    Deferred,
    /// Rotation saturated; nothing attempted, nothing written.
    Skipped,
}

impl CycleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CycleStatus::Completed => "completed",
            CycleStatus::Failed => "failed",
            CycleStatus::Deferred => "deferred",
            CycleStatus::Skipped => "skipped",
        }
    }
}

impl From<LogStatus> for CycleStatus {
    fn from(status: LogStatus) -> Self {
        match status {
            LogStatus::Completed => CycleStatus::Completed,
            LogStatus::Failed => CycleStatus::Failed,
            LogStatus::Deferred => CycleStatus::Deferred,
        }
    }
}

impl fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a cycle, rendered as the run summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub exit_code: i32,
    pub status: CycleStatus,
    pub agent: Option<String>,
    pub prompt_path: Option<PathBuf>,
    pub platform: String,
    pub reason: String,
    pub detail: Option<String>,
    /// Task log written for this cycle.
    pub log_path: Option<PathBuf>,
    pub memory_file: Option<PathBuf>,
}

impl CycleReport {
    fn from_record(record: &TaskLogRecord, exit_code: i32, log_path: PathBuf) -> Self {
        Self {
            exit_code,
            status: record.status.into(),
            agent: (record.agent != SCHEDULER_AGENT).then(|| record.agent.clone()),
            prompt_path: None,
            platform: record
                .metadata_value("platform")
                .unwrap_or_default()
                .to_string(),
            reason: record.reason.clone(),
            detail: record.detail.clone(),
            log_path: Some(log_path),
            memory_file: None,
        }
    }

    /// Operator-facing summary printed after the cycle.
    pub fn render_summary(&self) -> String {
        let none = "(none)";
        let mut lines = vec![
            "Scheduler run summary".to_string(),
            format!("Status: {}", self.status),
            format!("Agent: {}", self.agent.as_deref().unwrap_or(none)),
            format!(
                "Prompt: {}",
                self.prompt_path
                    .as_ref()
                    .map_or_else(|| none.to_string(), |p| p.display().to_string())
            ),
            format!("Platform: {}", self.platform),
            format!("Reason: {}", self.reason),
        ];
        if let Some(detail) = &self.detail {
            lines.push(format!("Detail: {detail}"));
        }
        if let Some(log_path) = &self.log_path {
            lines.push(format!("Log: {}", log_path.display()));
        }
        lines.push(String::new());
        lines.push("Learnings / Discoveries".to_string());
        lines.push(
            self.memory_file
                .as_deref()
                .and_then(read_learnings)
                .unwrap_or_else(|| "No learnings recorded.".to_string()),
        );
        lines.join("\n")
    }
}

/// Execute one scheduler cycle for `config.cadence`.
///
/// Returns `Err` only for unexpected failures. A roster error before selection
/// propagates without a task log; errors after selection are recorded as a
/// failed `execution_error` log first.
#[instrument(skip_all, fields(cadence = %config.cadence))]
pub fn run_cycle<R, B, S, C, G>(
    config: &SchedulerConfig,
    identity: &AgentIdentity,
    deps: &CycleDeps<'_, R, B, S, C>,
    rng: &mut G,
) -> Result<CycleReport>
where
    R: CommandRunner,
    B: LockBackend,
    S: Sleeper,
    C: Clock,
    G: Rng,
{
    let logs = TaskLogDir::new(&config.log_dir);

    if config.preflight.should_run()
        && let Some(report) = run_preflight(config, identity, deps, &logs)?
    {
        return Ok(report);
    }

    let now = deps.clock.now();
    let mut rotation = resolve_rotation(config, deps.backend, now)?;
    if rotation.is_saturated() {
        let reason = format!(
            "Cycle complete: all {} agents ran within the {} window",
            rotation.roster.len(),
            config.cadence.window_label()
        );
        info!(reason = %reason, "rotation saturated, skipping");
        return Ok(CycleReport {
            exit_code: exit_codes::OK,
            status: CycleStatus::Skipped,
            agent: None,
            prompt_path: None,
            platform: identity.platform.clone(),
            reason,
            detail: None,
            log_path: None,
            memory_file: None,
        });
    }

    let store = RunStateStore::new(&config.log_dir);
    let today = run_date(now);
    // Agents whose claim another scheduler won during this cycle.
    let mut lost: BTreeSet<String> = BTreeSet::new();

    loop {
        let excluded = merge(&rotation.excluded(), &lost);
        let Some(agent) = rotation.next(&excluded).map(str::to_string) else {
            let claimed: Vec<&str> = excluded.iter().map(String::as_str).collect();
            let record = TaskLogRecord::failed(
                config.cadence,
                SCHEDULER_AGENT,
                &identity.platform,
                "All roster tasks currently claimed by other agents",
            )
            .category(FailureCategory::RosterExhausted)
            .meta("excluded_agents", claimed.join(", "));
            return write_terminal(&logs, &record, exit_codes::FAILURE, deps.clock.now());
        };
        info!(agent = %agent, "selected agent");

        match attempt_agent(config, identity, deps, rng, &logs, &store, &today, &agent) {
            Ok(Some(report)) => return Ok(report),
            Ok(None) => {
                info!(agent = %agent, "lock already claimed, resolving exclusions again");
                lost.insert(agent);
                rotation = match resolve_rotation(config, deps.backend, deps.clock.now()) {
                    Ok(rotation) => rotation,
                    Err(err) => {
                        record_internal_failure(
                            config,
                            identity,
                            &logs,
                            SCHEDULER_AGENT,
                            &err,
                            deps.clock.now(),
                        );
                        return Err(err);
                    }
                };
            }
            Err(err) => {
                record_internal_failure(config, identity, &logs, &agent, &err, deps.clock.now());
                return Err(err);
            }
        }
    }
}

/// Claim `agent` and run it. `None` means another scheduler won the claim.
#[allow(clippy::too_many_arguments)]
fn attempt_agent<R, B, S, C, G>(
    config: &SchedulerConfig,
    identity: &AgentIdentity,
    deps: &CycleDeps<'_, R, B, S, C>,
    rng: &mut G,
    logs: &TaskLogDir,
    store: &RunStateStore,
    today: &str,
    agent: &str,
) -> Result<Option<CycleReport>>
where
    R: CommandRunner,
    B: LockBackend,
    S: Sleeper,
    C: Clock,
    G: Rng,
{
    let state = store.load(today);
    let carried_key = state
        .deferral_for(agent)
        .map(|record| record.idempotency_key.clone())
        .filter(|key| !key.is_empty());
    let request = LockRequest {
        agent,
        cadence: config.cadence,
        run_date: today,
        idempotency_key: carried_key.as_deref(),
    };
    let attempt = acquire_with_retry(deps.backend, &request, config.lock_retry, deps.sleeper, rng)?;

    match &attempt.exit {
        LockExit::Acquired => {}
        LockExit::AlreadyClaimed => return Ok(None),
        LockExit::BackendError(category) => {
            let category = category.clone();
            return handle_backend_failure(
                config, identity, deps, logs, store, today, &request, &attempt, &category,
            )
            .map(Some);
        }
        LockExit::Failed(code) => {
            let record =
                TaskLogRecord::failed(config.cadence, agent, &identity.platform, "Failed to acquire lock")
                    .detail(format!(
                        "Lock command exited with code {code}. Prompt not executed."
                    ))
                    .category(FailureCategory::LockBackend)
                    .meta("lock_attempts_total", attempt.attempts)
                    .meta("lock_correlation_id", &attempt.correlation_id)
                    .meta("lock_command", deps.backend.describe_lock(agent, config.cadence))
                    .meta("lock_stderr_excerpt", or_empty(excerpt(&attempt.output.stderr)))
                    .meta("lock_stdout_excerpt", or_empty(excerpt(&attempt.output.stdout)));
            return write_terminal(logs, &record, *code, deps.clock.now()).map(Some);
        }
    }

    if state.lock_deferral.is_some() {
        store.update(today, |state| state.lock_deferral = None)?;
        info!(agent = %agent, "lock acquired, cleared deferral state");
    }

    let started_at = deps.clock.now();
    let outcome = run_pipeline(config, identity, agent, started_at, deps.runner, deps.backend)?;
    let record = outcome
        .record
        .clone()
        .meta("lock_correlation_id", &attempt.correlation_id)
        .meta("lock_attempts_total", attempt.attempts);
    let mut report = write_terminal(logs, &record, outcome.exit_code, deps.clock.now())?;
    report.prompt_path = Some(outcome.prompt_path);
    report.memory_file = outcome.memory_file;
    Ok(Some(report))
}

/// Lock retries exhausted with a backend error: fail hard or defer.
#[allow(clippy::too_many_arguments)]
fn handle_backend_failure<R, B, S, C>(
    config: &SchedulerConfig,
    identity: &AgentIdentity,
    deps: &CycleDeps<'_, R, B, S, C>,
    logs: &TaskLogDir,
    store: &RunStateStore,
    today: &str,
    request: &LockRequest<'_>,
    attempt: &LockAttempt,
    category: &BackendCategory,
) -> Result<CycleReport>
where
    B: LockBackend,
    C: Clock,
{
    let cadence = config.cadence;
    let agent = request.agent;
    let now = deps.clock.now();
    let policy = config.deferral;
    let new_key = || idempotency_key(cadence, agent, today, &Uuid::new_v4().to_string());

    let decision: DeferralDecision = if policy.strict_lock {
        decide_backend_failure(None, agent, category.as_str(), policy, now, new_key)
    } else {
        store.update(today, |state| {
            let decision = decide_backend_failure(
                state.lock_deferral.as_ref(),
                agent,
                category.as_str(),
                policy,
                now,
                new_key,
            );
            state.lock_deferral = Some(decision.record.clone());
            decision
        })?
    };

    let remediation = remediation_text(
        &deps.backend.describe_lock(agent, cadence),
        &deps.backend.describe_health(cadence),
        config.retry_window_minutes(),
        policy.max_deferrals,
    );
    let deferral = &decision.record;

    if decision.is_deferred() {
        warn!(
            agent = %agent,
            backend_category = %category,
            deferral_attempt_count = deferral.attempt_count,
            "lock backend unavailable, deferring"
        );
        let record = TaskLogRecord::new(
            cadence,
            agent,
            LogStatus::Deferred,
            &identity.platform,
            "Lock backend deferred",
        )
        .detail(format!(
            "Deferred after lock backend failure ({category}); retry window active and deferral budget remaining. Prompt not executed. {remediation}"
        ))
        .category(FailureCategory::LockBackend)
        .meta("failure_class", BACKEND_UNAVAILABLE)
        .meta("deferral_attempt_count", deferral.attempt_count)
        .meta("deferral_first_failure_timestamp", &deferral.first_failure_timestamp)
        .meta("backend_category", category)
        .meta("lock_idempotency_key", &deferral.idempotency_key);
        return write_terminal(logs, &record, exit_codes::OK, deps.clock.now());
    }

    let summary = summarize_lock_failure_reasons(&diagnostic_events(&attempt.output));
    let timeline_ms = summary
        .total_elapsed_ms
        .unwrap_or_else(|| attempt.backoff_schedule_ms.iter().sum());
    let schedule = attempt.backoff_schedule();
    let exhausted = decision.kind == DeferralKind::Exhausted;

    warn!(
        agent = %agent,
        backend_category = %category,
        attempts = attempt.attempts,
        "lock backend error, prompt not executed"
    );
    let record = TaskLogRecord::failed(cadence, agent, &identity.platform, "Lock backend error")
        .detail(format!(
            "Lock backend error ({category}) after {} attempt(s). Prompt not executed. {remediation}",
            attempt.attempts
        ))
        .category(FailureCategory::LockBackend)
        .meta("failure_class", BACKEND_UNAVAILABLE)
        .meta("backend_category", category)
        .meta("lock_attempts_total", attempt.attempts)
        .meta(
            "lock_backoff_schedule_ms",
            if schedule.is_empty() { "(none)".to_string() } else { schedule },
        )
        .meta(
            "lock_correlation_id",
            summary
                .correlation_id
                .clone()
                .unwrap_or_else(|| attempt.correlation_id.clone()),
        )
        .meta(
            "lock_attempt_id",
            summary
                .attempt_id
                .clone()
                .unwrap_or_else(|| attempt.attempts.to_string()),
        )
        .meta("lock_total_retry_timeline_ms", timeline_ms)
        .meta("lock_failure_reason_distribution", summary.distribution_json())
        .meta_opt("deferral_attempt_count", exhausted.then_some(deferral.attempt_count))
        .meta_opt(
            "deferral_first_failure_timestamp",
            exhausted.then_some(&deferral.first_failure_timestamp),
        )
        .meta("lock_command", deps.backend.describe_lock(agent, cadence))
        .meta_opt(
            "lock_idempotency_key",
            if exhausted {
                Some(deferral.idempotency_key.as_str())
            } else {
                request.idempotency_key
            },
        )
        .meta("lock_stderr_excerpt", or_empty(excerpt(&attempt.output.stderr)))
        .meta("lock_stdout_excerpt", or_empty(excerpt(&attempt.output.stdout)));
    write_terminal(logs, &record, exit_codes::LOCK_BACKEND, deps.clock.now())
}

/// Relay health check before selection. `Some` short-circuits the cycle.
fn run_preflight<R, B, S, C>(
    config: &SchedulerConfig,
    identity: &AgentIdentity,
    deps: &CycleDeps<'_, R, B, S, C>,
    logs: &TaskLogDir,
) -> Result<Option<CycleReport>>
where
    B: LockBackend,
    C: Clock,
{
    let cadence = config.cadence;
    let output = deps.backend.health(cadence).unwrap_or_else(|err| {
        warn!(err = %format!("{err:#}"), "lock health preflight could not run");
        CommandOutput::launch_failure(&err)
    });
    let health = HealthReport::from_payload(structured_payload(&output).as_ref());
    if output.success() && !health.reports_failure() {
        info!(relays = health.relays.len(), "lock health preflight passed");
        return Ok(None);
    }

    let category = health
        .failure_category
        .clone()
        .filter(|c| !c.trim().is_empty())
        .unwrap_or_else(|| {
            let text = match &health.error {
                Some(error) => format!("{error}\n{}", output.diagnostics()),
                None => output.diagnostics(),
            };
            classify_backend_error(&text).as_str().to_string()
        });
    let remediation = remediation_text(
        &deps.backend.describe_lock("<agent>", cadence),
        &deps.backend.describe_health(cadence),
        config.retry_window_minutes(),
        config.deferral.max_deferrals,
    );
    let category = redact(&category);
    let relays = if health.relays.is_empty() {
        "(none)".to_string()
    } else {
        redact(&health.relays.join(", "))
    };

    warn!(category = %category, exit_code = output.code, "lock health preflight failed");
    let record = TaskLogRecord::failed(
        cadence,
        SCHEDULER_AGENT,
        &identity.platform,
        "Lock backend unavailable preflight",
    )
    .detail(format!(
        "Preflight failed ({category}). Prompt not executed. {remediation}"
    ))
    .category(FailureCategory::LockBackend)
    .meta("failure_class", BACKEND_UNAVAILABLE)
    .meta("preflight_failure_category", &category)
    .meta("relay_list", relays)
    .meta("preflight_stderr_excerpt", or_empty(excerpt(&output.stderr)))
    .meta("preflight_stdout_excerpt", or_empty(excerpt(&output.stdout)));
    write_terminal(logs, &record, exit_codes::LOCK_BACKEND, deps.clock.now()).map(Some)
}

fn write_terminal(
    logs: &TaskLogDir,
    record: &TaskLogRecord,
    exit_code: i32,
    created_at: DateTime<Utc>,
) -> Result<CycleReport> {
    let path = logs.write(record, created_at)?;
    Ok(CycleReport::from_record(record, exit_code, path))
}

/// Best effort: the original error is what the caller reports.
fn record_internal_failure(
    config: &SchedulerConfig,
    identity: &AgentIdentity,
    logs: &TaskLogDir,
    agent: &str,
    err: &anyhow::Error,
    created_at: DateTime<Utc>,
) {
    let record = TaskLogRecord::failed(
        config.cadence,
        agent,
        &identity.platform,
        "Scheduler internal error",
    )
    .detail(excerpt(&format!("{err:#}")))
    .category(FailureCategory::Execution);
    if let Err(write_err) = logs.write(&record, created_at) {
        warn!(err = %format!("{write_err:#}"), "failed to record internal error");
    }
}

fn or_empty(text: String) -> String {
    if text.is_empty() {
        "(empty)".to_string()
    } else {
        text
    }
}
