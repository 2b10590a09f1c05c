//! Cycle-level scenarios driven through `run_cycle` with scripted collaborators.
//!
//! Each test builds a temporary scheduler root, scripts the lock backend and
//! child commands, and checks the exit code, the single task log written and
//! the persisted run state.

use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use scheduler::core::classifier::classify_backend_error;
use scheduler::core::types::Cadence;
use scheduler::cycle::{CycleDeps, CycleReport, CycleStatus, run_cycle};
use scheduler::io::config::MemoryMode;
use scheduler::io::run_state::RunStateStore;
use scheduler::io::task_log::{ParsedTaskLog, read_task_log};
use scheduler::pipeline::AgentIdentity;
use scheduler::test_support::{
    BackendCall, ManualClock, RecordingSleeper, ScriptedBackend, ScriptedRunner, TestWorkspace,
    output,
};

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 15, 9, 0, 0).unwrap()
}

fn identity() -> AgentIdentity {
    AgentIdentity::new("linux", None)
}

fn cycle(
    workspace: &TestWorkspace,
    runner: &ScriptedRunner,
    backend: &ScriptedBackend,
    sleeper: &RecordingSleeper,
    clock: &ManualClock,
) -> CycleReport {
    let config = workspace.config(Cadence::Daily);
    let deps = CycleDeps {
        runner,
        backend,
        sleeper,
        clock,
    };
    run_cycle(&config, &identity(), &deps, &mut StdRng::seed_from_u64(7)).expect("cycle")
}

fn single_log(workspace: &TestWorkspace) -> ParsedTaskLog {
    let logs = workspace.task_logs(Cadence::Daily);
    assert_eq!(logs.len(), 1, "expected exactly one task log, got {logs:?}");
    read_task_log(&logs[0]).expect("read log")
}

fn last_log(workspace: &TestWorkspace) -> ParsedTaskLog {
    let logs = workspace.task_logs(Cadence::Daily);
    read_task_log(logs.last().expect("at least one log")).expect("read log")
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .expect("file name")
        .to_string_lossy()
        .into_owned()
}

#[test]
fn rotation_advances_then_saturates() {
    let workspace = TestWorkspace::new(&["alpha", "beta"]).expect("workspace");
    let runner = ScriptedRunner::new();
    let backend = ScriptedBackend::new();
    let sleeper = RecordingSleeper::default();
    let clock = ManualClock::new(start());

    let first = cycle(&workspace, &runner, &backend, &sleeper, &clock);
    assert_eq!(first.exit_code, 0);
    assert_eq!(first.status, CycleStatus::Completed);
    assert_eq!(first.agent.as_deref(), Some("alpha"));

    clock.advance(chrono::Duration::hours(1));
    let second = cycle(&workspace, &runner, &backend, &sleeper, &clock);
    assert_eq!(second.agent.as_deref(), Some("beta"));
    assert_eq!(backend.complete_agents(), vec!["alpha", "beta"]);

    clock.advance(chrono::Duration::hours(1));
    let third = cycle(&workspace, &runner, &backend, &sleeper, &clock);
    assert_eq!(third.status, CycleStatus::Skipped);
    assert_eq!(third.exit_code, 0);
    assert_eq!(
        third.reason,
        "Cycle complete: all 2 agents ran within the 24-hour window"
    );

    let names: Vec<String> = workspace
        .task_logs(Cadence::Daily)
        .iter()
        .map(|p| file_name(p))
        .collect();
    assert_eq!(
        names,
        vec![
            "2026-02-15T09-00-00Z__alpha__completed.md",
            "2026-02-15T10-00-00Z__beta__completed.md",
        ]
    );
    let log = last_log(&workspace);
    assert_eq!(log.get("status"), Some("completed"));
    assert_eq!(log.get("reason"), Some("Scheduler cycle completed successfully"));
    assert_eq!(log.get("platform"), Some("linux"));
}

#[test]
fn recency_window_boundary() {
    let workspace = TestWorkspace::new(&["alpha"]).expect("workspace");
    let runner = ScriptedRunner::new();
    let backend = ScriptedBackend::new();
    let sleeper = RecordingSleeper::default();
    let clock = ManualClock::new(start());

    assert_eq!(
        cycle(&workspace, &runner, &backend, &sleeper, &clock).status,
        CycleStatus::Completed
    );

    clock.set(start() + chrono::Duration::minutes(23 * 60 + 59));
    assert_eq!(
        cycle(&workspace, &runner, &backend, &sleeper, &clock).status,
        CycleStatus::Skipped
    );

    clock.set(start() + chrono::Duration::minutes(24 * 60 + 1));
    let report = cycle(&workspace, &runner, &backend, &sleeper, &clock);
    assert_eq!(report.status, CycleStatus::Completed);
    assert_eq!(report.agent.as_deref(), Some("alpha"));
}

#[test]
fn remote_claims_are_skipped() {
    let workspace = TestWorkspace::new(&["alpha", "beta", "gamma"]).expect("workspace");
    let runner = ScriptedRunner::new();
    let backend = ScriptedBackend::new().with_check(output(
        0,
        "checking relays...\n{\"locked\":[\"alpha\"],\"paused\":[],\"completed\":[\"beta\"]}\n",
        "",
    ));
    let sleeper = RecordingSleeper::default();
    let clock = ManualClock::new(start());

    let report = cycle(&workspace, &runner, &backend, &sleeper, &clock);
    assert_eq!(report.agent.as_deref(), Some("gamma"));
    assert_eq!(backend.lock_agents(), vec!["gamma"]);
}

#[test]
fn roster_exhaustion_fails_without_locking() {
    let workspace = TestWorkspace::new(&["alpha", "beta"]).expect("workspace");
    let runner = ScriptedRunner::new();
    let backend =
        ScriptedBackend::new().with_check(output(0, "{\"excluded\":[\"alpha\",\"beta\"]}", ""));
    let sleeper = RecordingSleeper::default();
    let clock = ManualClock::new(start());

    let report = cycle(&workspace, &runner, &backend, &sleeper, &clock);
    assert_eq!(report.exit_code, 1);
    assert_eq!(report.agent, None);
    assert!(backend.lock_agents().is_empty());

    let log = single_log(&workspace);
    assert_eq!(log.get("agent"), Some("scheduler"));
    assert_eq!(
        log.get("reason"),
        Some("All roster tasks currently claimed by other agents")
    );
    assert_eq!(log.get("failure_category"), Some("roster_exhausted"));
}

#[test]
fn quorum_failure_exhausts_retries_and_fails_hard() {
    let mut workspace = TestWorkspace::new(&["alpha"]).expect("workspace");
    workspace.file.lock_retry.max_retries = 1;
    let runner = ScriptedRunner::new();
    let quorum_event = "{\"event\":\"lock_publish_quorum_failed\",\"reasonDistribution\":{\"rate-limited\":1,\"auth-required\":2},\"attemptId\":\"a-2\",\"correlationId\":\"corr-9\",\"totalElapsedMs\":1234}";
    let backend = ScriptedBackend::new().with_locks([
        output(2, "", "publish failed to all relays"),
        output(2, "", &format!("publish failed to all relays\n{quorum_event}")),
    ]);
    let sleeper = RecordingSleeper::default();
    let clock = ManualClock::new(start());

    let report = cycle(&workspace, &runner, &backend, &sleeper, &clock);
    assert_eq!(report.exit_code, 2);
    assert_eq!(report.status, CycleStatus::Failed);
    assert_eq!(backend.lock_agents(), vec!["alpha", "alpha"]);
    assert_eq!(sleeper.delays(), vec![Duration::from_millis(250)]);
    assert_eq!(
        backend.lock_env_values("SCHEDULER_LOCK_ATTEMPT_ID"),
        vec![Some("1".to_string()), Some("2".to_string())]
    );
    assert!(backend.complete_agents().is_empty());
    assert!(runner.specs().is_empty(), "prompt must not execute");

    let log = single_log(&workspace);
    assert_eq!(log.get("reason"), Some("Lock backend error"));
    assert_eq!(log.get("failure_category"), Some("lock_backend_error"));
    assert_eq!(log.get("failure_class"), Some("backend_unavailable"));
    assert_eq!(log.get("backend_category"), Some("relay_publish_quorum_failure"));
    assert_eq!(log.get("lock_attempts_total"), Some("2"));
    assert_eq!(log.get("lock_backoff_schedule_ms"), Some("250"));
    assert_eq!(log.get("lock_correlation_id"), Some("corr-9"));
    assert_eq!(log.get("lock_attempt_id"), Some("a-2"));
    assert_eq!(log.get("lock_total_retry_timeline_ms"), Some("1234"));
    assert_eq!(
        log.get("lock_failure_reason_distribution"),
        Some("{\"auth-required\":2,\"rate-limited\":1}")
    );
    assert_eq!(log.get("lock_stdout_excerpt"), Some("(empty)"));
    let detail = log.get("detail").expect("detail");
    assert!(detail.starts_with(
        "Lock backend error (relay_publish_quorum_failure) after 2 attempt(s). Prompt not executed."
    ));
    assert!(detail.contains("Retry command: lock --agent alpha --cadence daily"));
    assert!(detail.contains("Run health check: health --cadence daily"));

    let state = RunStateStore::new(&workspace.config(Cadence::Daily).log_dir).load("2026-02-15");
    assert_eq!(state.lock_deferral, None, "strict mode never persists deferrals");
}

#[test]
fn deferral_budget_then_hard_failure_with_stable_key() {
    let mut workspace = TestWorkspace::new(&["alpha"]).expect("workspace");
    workspace.file.lock_retry.max_retries = 0;
    workspace.file.lock_failure_policy.strict_lock = false;
    workspace.file.lock_failure_policy.max_deferrals = 1;
    let runner = ScriptedRunner::new();
    let backend = ScriptedBackend::new().with_locks([
        output(2, "", "relay query timeout after 5000ms"),
        output(2, "", "relay query timeout after 5000ms"),
    ]);
    let sleeper = RecordingSleeper::default();
    let clock = ManualClock::new(start());
    let store = RunStateStore::new(&workspace.config(Cadence::Daily).log_dir);

    let first = cycle(&workspace, &runner, &backend, &sleeper, &clock);
    assert_eq!(first.exit_code, 0);
    assert_eq!(first.status, CycleStatus::Deferred);
    let record = store
        .load("2026-02-15")
        .lock_deferral
        .expect("deferral persisted");
    assert_eq!(record.selected_agent, "alpha");
    assert_eq!(record.attempt_count, 1);
    assert_eq!(record.backend_category, "relay_query_timeout");
    assert!(record.idempotency_key.starts_with("daily:alpha:2026-02-15:"));
    let deferred = single_log(&workspace);
    assert_eq!(deferred.get("status"), Some("deferred"));
    assert_eq!(deferred.get("reason"), Some("Lock backend deferred"));
    assert_eq!(
        deferred.get("lock_idempotency_key"),
        Some(record.idempotency_key.as_str())
    );

    clock.advance(chrono::Duration::minutes(10));
    let second = cycle(&workspace, &runner, &backend, &sleeper, &clock);
    assert_eq!(second.exit_code, 2);
    assert_eq!(second.status, CycleStatus::Failed);
    assert_eq!(
        backend.lock_env_values("SCHEDULER_LOCK_IDEMPOTENCY_KEY"),
        vec![None, Some(record.idempotency_key.clone())]
    );
    assert_eq!(
        backend.lock_env_values("SCHEDULER_LOCK_CORRELATION_ID")[1].as_deref(),
        Some(record.idempotency_key.as_str())
    );

    let failed = last_log(&workspace);
    assert_eq!(failed.get("status"), Some("failed"));
    assert_eq!(failed.get("deferral_attempt_count"), Some("2"));
    assert_eq!(
        failed.get("deferral_first_failure_timestamp"),
        Some("2026-02-15T09:00:00.000Z")
    );
    assert_eq!(
        failed.get("lock_idempotency_key"),
        Some(record.idempotency_key.as_str())
    );

    let exhausted = store.load("2026-02-15").lock_deferral.expect("kept");
    assert_eq!(exhausted.attempt_count, 2);
    assert_eq!(exhausted.idempotency_key, record.idempotency_key);
}

#[test]
fn deferral_retry_window_expiry_fails_hard() {
    let mut workspace = TestWorkspace::new(&["alpha"]).expect("workspace");
    workspace.file.lock_retry.max_retries = 0;
    workspace.file.lock_failure_policy.strict_lock = false;
    workspace.file.lock_failure_policy.max_deferrals = 5;
    workspace.file.lock_failure_policy.degraded_lock_retry_window_ms = 30 * 60 * 1000;
    let runner = ScriptedRunner::new();
    let backend = ScriptedBackend::new().with_locks([
        output(2, "", "connect ECONNREFUSED 127.0.0.1:7777"),
        output(2, "", "connect ECONNREFUSED 127.0.0.1:7777"),
    ]);
    let sleeper = RecordingSleeper::default();
    let clock = ManualClock::new(start());

    assert_eq!(
        cycle(&workspace, &runner, &backend, &sleeper, &clock).status,
        CycleStatus::Deferred
    );
    clock.advance(chrono::Duration::minutes(31));
    let report = cycle(&workspace, &runner, &backend, &sleeper, &clock);
    assert_eq!(report.exit_code, 2);
    let log = last_log(&workspace);
    assert_eq!(
        log.get("backend_category"),
        Some("websocket_connection_refused_or_dns")
    );
    assert!(
        log.get("detail")
            .expect("detail")
            .contains("Retry window: 30 minute(s) (max deferrals: 5).")
    );
}

#[test]
fn successful_lock_clears_deferral() {
    let mut workspace = TestWorkspace::new(&["alpha"]).expect("workspace");
    workspace.file.lock_retry.max_retries = 0;
    workspace.file.lock_failure_policy.strict_lock = false;
    let runner = ScriptedRunner::new();
    let backend = ScriptedBackend::new().with_locks([output(2, "", "")]);
    let sleeper = RecordingSleeper::default();
    let clock = ManualClock::new(start());
    let store = RunStateStore::new(&workspace.config(Cadence::Daily).log_dir);

    assert_eq!(
        cycle(&workspace, &runner, &backend, &sleeper, &clock).status,
        CycleStatus::Deferred
    );
    let key = store
        .load("2026-02-15")
        .lock_deferral
        .expect("deferral")
        .idempotency_key;

    clock.advance(chrono::Duration::minutes(5));
    let report = cycle(&workspace, &runner, &backend, &sleeper, &clock);
    assert_eq!(report.status, CycleStatus::Completed);
    assert_eq!(
        backend.lock_env_values("SCHEDULER_LOCK_IDEMPOTENCY_KEY")[1],
        Some(key)
    );
    assert_eq!(store.load("2026-02-15").lock_deferral, None);
}

#[test]
fn lost_race_reselects_within_the_cycle() {
    let workspace = TestWorkspace::new(&["alpha", "beta"]).expect("workspace");
    let runner = ScriptedRunner::new();
    let backend = ScriptedBackend::new().with_locks([output(3, "", "already claimed")]);
    let sleeper = RecordingSleeper::default();
    let clock = ManualClock::new(start());

    let report = cycle(&workspace, &runner, &backend, &sleeper, &clock);
    assert_eq!(report.status, CycleStatus::Completed);
    assert_eq!(report.agent.as_deref(), Some("beta"));
    assert_eq!(backend.lock_agents(), vec!["alpha", "beta"]);
    assert!(sleeper.delays().is_empty());
    assert_eq!(single_log(&workspace).get("agent"), Some("beta"));
}

#[test]
fn lost_race_sees_claims_published_meanwhile() {
    let workspace = TestWorkspace::new(&["alpha", "beta", "gamma"]).expect("workspace");
    let runner = ScriptedRunner::new();
    let backend = ScriptedBackend::new()
        .with_checks([
            output(0, "{\"locked\":[]}", ""),
            output(0, "{\"locked\":[\"beta\"]}", ""),
        ])
        .with_locks([output(3, "", "already claimed")]);
    let sleeper = RecordingSleeper::default();
    let clock = ManualClock::new(start());

    let report = cycle(&workspace, &runner, &backend, &sleeper, &clock);
    assert_eq!(report.status, CycleStatus::Completed);
    assert_eq!(report.agent.as_deref(), Some("gamma"));
    assert_eq!(backend.lock_agents(), vec!["alpha", "gamma"]);
    let checks = backend
        .calls()
        .into_iter()
        .filter(|call| *call == BackendCall::Check)
        .count();
    assert_eq!(checks, 2);
}

#[test]
fn check_launch_failure_treats_remote_claims_as_empty() {
    let workspace = TestWorkspace::new(&["alpha", "beta"]).expect("workspace");
    let runner = ScriptedRunner::new();
    let backend = ScriptedBackend::new()
        .with_check_error("spawn `relay-check`: No such file or directory (os error 2)");
    let sleeper = RecordingSleeper::default();
    let clock = ManualClock::new(start());

    let report = cycle(&workspace, &runner, &backend, &sleeper, &clock);
    assert_eq!(report.status, CycleStatus::Completed);
    assert_eq!(report.agent.as_deref(), Some("alpha"));
    assert_eq!(single_log(&workspace).get("status"), Some("completed"));
}

#[test]
fn unknown_lock_exit_code_is_propagated() {
    let workspace = TestWorkspace::new(&["alpha"]).expect("workspace");
    let runner = ScriptedRunner::new();
    let backend = ScriptedBackend::new().with_locks([output(5, "", "boom")]);
    let sleeper = RecordingSleeper::default();
    let clock = ManualClock::new(start());

    let report = cycle(&workspace, &runner, &backend, &sleeper, &clock);
    assert_eq!(report.exit_code, 5);
    assert_eq!(backend.lock_agents().len(), 1);
    let log = single_log(&workspace);
    assert_eq!(log.get("reason"), Some("Failed to acquire lock"));
    assert_eq!(log.get("lock_stderr_excerpt"), Some("boom"));
}

#[test]
fn validation_failure_never_publishes_completion() {
    let mut workspace = TestWorkspace::new(&["alpha"]).expect("workspace");
    workspace.file.cadences.daily.validation_commands =
        vec!["npm run lint".to_string(), "npm test".to_string()];
    let runner = ScriptedRunner::new().respond("npm run lint", output(7, "", "3 lint errors"));
    let backend = ScriptedBackend::new();
    let sleeper = RecordingSleeper::default();
    let clock = ManualClock::new(start());

    let report = cycle(&workspace, &runner, &backend, &sleeper, &clock);
    assert_eq!(report.exit_code, 7);
    assert_eq!(report.status, CycleStatus::Failed);
    assert!(backend.complete_agents().is_empty());
    assert!(
        !runner.command_lines().iter().any(|line| line.contains("npm test")),
        "later validation commands must not run"
    );

    let log = single_log(&workspace);
    assert_eq!(log.get("reason"), Some("Validation failed"));
    assert_eq!(log.get("detail"), Some("npm run lint"));
    assert_eq!(log.get("failure_category"), Some("execution_error"));
    assert_eq!(log.get("stderr_excerpt"), Some("3 lint errors"));
}

#[test]
fn validation_failure_detail_is_redacted() {
    let mut workspace = TestWorkspace::new(&["alpha"]).expect("workspace");
    workspace.file.cadences.daily.validation_commands =
        vec!["deploy-check --api-key=abc123 --dry-run".to_string()];
    let runner = ScriptedRunner::new().respond("deploy-check", output(1, "", "rejected"));
    let backend = ScriptedBackend::new();
    let sleeper = RecordingSleeper::default();
    let clock = ManualClock::new(start());

    cycle(&workspace, &runner, &backend, &sleeper, &clock);
    let log = single_log(&workspace);
    assert_eq!(
        log.get("detail"),
        Some("deploy-check --api-key=[REDACTED] --dry-run")
    );
}

#[test]
fn handoff_receives_scheduler_environment() {
    let mut workspace = TestWorkspace::new(&["alpha"]).expect("workspace");
    workspace.file.cadences.daily.handoff_command = Some("./run-agent.sh".to_string());
    let runner = ScriptedRunner::new();
    let backend = ScriptedBackend::new();
    let sleeper = RecordingSleeper::default();
    let clock = ManualClock::new(start());

    cycle(&workspace, &runner, &backend, &sleeper, &clock);
    let specs = runner.specs();
    let handoff = specs
        .iter()
        .find(|spec| spec.args.iter().any(|arg| arg == "./run-agent.sh"))
        .expect("handoff spec");
    assert_eq!(handoff.program, "bash");
    let env = |key: &str| {
        handoff
            .env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    };
    assert_eq!(env("SCHEDULER_AGENT").as_deref(), Some("alpha"));
    assert_eq!(env("SCHEDULER_CADENCE").as_deref(), Some("daily"));
    assert_eq!(env("AGENT_PLATFORM").as_deref(), Some("linux"));
    assert!(
        env("SCHEDULER_PROMPT_PATH")
            .expect("prompt path")
            .ends_with("prompts/daily/alpha.md")
    );
    assert!(
        env("SCHEDULER_MEMORY_FILE")
            .expect("memory file")
            .ends_with("2026-02-15T09-00-00Z__alpha.md")
    );
}

#[test]
fn handoff_failure_propagates_exit_code() {
    let workspace = TestWorkspace::new(&["alpha"]).expect("workspace");
    let runner = ScriptedRunner::new().respond("simulated execution", output(4, "", "crash"));
    let backend = ScriptedBackend::new();
    let sleeper = RecordingSleeper::default();
    let clock = ManualClock::new(start());

    let report = cycle(&workspace, &runner, &backend, &sleeper, &clock);
    assert_eq!(report.exit_code, 4);
    let log = single_log(&workspace);
    assert_eq!(log.get("reason"), Some("Prompt/handoff execution failed"));
    assert_eq!(log.get("detail"), Some("Handoff callback failed."));
    assert!(backend.complete_agents().is_empty());
}

#[test]
fn malformed_prompt_is_rejected_after_lock() {
    let workspace = TestWorkspace::new(&["alpha"]).expect("workspace");
    workspace
        .write_prompt(Cadence::Daily, "alpha", "no heading here\n")
        .expect("prompt");
    let runner = ScriptedRunner::new();
    let backend = ScriptedBackend::new();
    let sleeper = RecordingSleeper::default();
    let clock = ManualClock::new(start());

    let report = cycle(&workspace, &runner, &backend, &sleeper, &clock);
    assert_eq!(report.exit_code, 1);
    assert!(runner.specs().is_empty());
    assert!(backend.complete_agents().is_empty());
    let log = single_log(&workspace);
    assert_eq!(log.get("failure_category"), Some("prompt_schema_error"));
}

#[test]
fn required_memory_policy_needs_evidence() {
    let mut workspace = TestWorkspace::new(&["alpha"]).expect("workspace");
    workspace.file.cadences.daily.memory_policy.mode = MemoryMode::Required;
    let runner = ScriptedRunner::new();
    let backend = ScriptedBackend::new();
    let sleeper = RecordingSleeper::default();
    let clock = ManualClock::new(start());

    let report = cycle(&workspace, &runner, &backend, &sleeper, &clock);
    assert_eq!(report.exit_code, 1);
    let log = single_log(&workspace);
    assert_eq!(log.get("reason"), Some("Required memory steps not verified"));
    assert_eq!(log.get("detail"), Some("Missing evidence for: retrieve, store"));
    assert!(backend.complete_agents().is_empty());
}

#[test]
fn required_memory_policy_accepts_markers() {
    let mut workspace = TestWorkspace::new(&["alpha"]).expect("workspace");
    workspace.file.cadences.daily.memory_policy.mode = MemoryMode::Required;
    let runner = ScriptedRunner::new().respond(
        "simulated execution",
        output(0, "MEMORY_RETRIEVED 3 items\nwork done\nMEMORY_STORED\n", ""),
    );
    let backend = ScriptedBackend::new();
    let sleeper = RecordingSleeper::default();
    let clock = ManualClock::new(start());

    let report = cycle(&workspace, &runner, &backend, &sleeper, &clock);
    assert_eq!(report.status, CycleStatus::Completed);
    assert_eq!(backend.complete_agents(), vec!["alpha"]);
}

#[test]
fn artifact_verifier_failure_blocks_completion() {
    let mut workspace = TestWorkspace::new(&["alpha"]).expect("workspace");
    workspace.file.artifact_verifier = Some("node scripts/verify-run-artifacts.mjs".to_string());
    let runner = ScriptedRunner::new().respond(
        "verify-run-artifacts",
        output(6, "", "missing task log for alpha\n"),
    );
    let backend = ScriptedBackend::new();
    let sleeper = RecordingSleeper::default();
    let clock = ManualClock::new(start());

    let report = cycle(&workspace, &runner, &backend, &sleeper, &clock);
    assert_eq!(report.exit_code, 6);
    let verifier = runner
        .specs()
        .into_iter()
        .find(|spec| spec.program == "node")
        .expect("verifier ran");
    assert_eq!(
        verifier.args[..7],
        [
            "scripts/verify-run-artifacts.mjs",
            "--since",
            "2026-02-15T09:00:00.000Z",
            "--agent",
            "alpha",
            "--cadence",
            "daily",
        ]
    );
    assert_eq!(
        verifier.args.last().map(String::as_str),
        Some("--check-failure-notes")
    );
    let log = single_log(&workspace);
    assert_eq!(log.get("reason"), Some("Missing required run artifacts"));
    assert_eq!(log.get("detail"), Some("missing task log for alpha"));
    assert!(backend.complete_agents().is_empty());
}

#[test]
fn completion_publish_failure_is_not_completed() {
    let workspace = TestWorkspace::new(&["alpha"]).expect("workspace");
    let runner = ScriptedRunner::new();
    let backend =
        ScriptedBackend::new().with_complete(output(2, "", "publish failed to all relays"));
    let sleeper = RecordingSleeper::default();
    let clock = ManualClock::new(start());

    let report = cycle(&workspace, &runner, &backend, &sleeper, &clock);
    assert_eq!(report.exit_code, 2);
    assert_eq!(report.status, CycleStatus::Failed);
    let log = single_log(&workspace);
    assert_eq!(log.get("status"), Some("failed"));
    assert!(
        log.get("detail")
            .expect("detail")
            .starts_with("Completion publish failed. Retry complete --agent alpha --cadence daily")
    );
}

#[test]
fn preflight_failure_short_circuits() {
    let mut workspace = TestWorkspace::new(&["alpha"]).expect("workspace");
    workspace.file.lock_health_preflight.enabled = true;
    let runner = ScriptedRunner::new();
    let backend = ScriptedBackend::new().with_health(output(
        0,
        "{\"ok\":false,\"relays\":[\"wss://a.example\",\"wss://b.example\"],\"failureCategory\":\"relay_query_timeout\"}",
        "",
    ));
    let sleeper = RecordingSleeper::default();
    let clock = ManualClock::new(start());

    let report = cycle(&workspace, &runner, &backend, &sleeper, &clock);
    assert_eq!(report.exit_code, 2);
    assert!(backend.lock_agents().is_empty());
    assert!(runner.specs().is_empty());

    let log = single_log(&workspace);
    assert_eq!(log.get("agent"), Some("scheduler"));
    assert_eq!(log.get("reason"), Some("Lock backend unavailable preflight"));
    assert_eq!(log.get("failure_class"), Some("backend_unavailable"));
    assert_eq!(log.get("preflight_failure_category"), Some("relay_query_timeout"));
    assert_eq!(log.get("relay_list"), Some("wss://a.example, wss://b.example"));
    assert_eq!(log.get("preflight_stderr_excerpt"), Some("(empty)"));
}

#[test]
fn preflight_failure_without_payload_is_classified() {
    let mut workspace = TestWorkspace::new(&["alpha"]).expect("workspace");
    workspace.file.lock_health_preflight.enabled = true;
    let runner = ScriptedRunner::new();
    let backend =
        ScriptedBackend::new().with_health(output(1, "", "getaddrinfo ENOTFOUND relay.example"));
    let sleeper = RecordingSleeper::default();
    let clock = ManualClock::new(start());

    cycle(&workspace, &runner, &backend, &sleeper, &clock);
    let log = single_log(&workspace);
    assert_eq!(
        log.get("preflight_failure_category"),
        Some("websocket_connection_refused_or_dns")
    );
    assert_eq!(log.get("relay_list"), Some("(none)"));
}

#[test]
fn preflight_launch_failure_is_recorded() {
    let mut workspace = TestWorkspace::new(&["alpha"]).expect("workspace");
    workspace.file.lock_health_preflight.enabled = true;
    let runner = ScriptedRunner::new();
    let error = "spawn `relay-health`: No such file or directory (os error 2)";
    let backend = ScriptedBackend::new().with_health_error(error);
    let sleeper = RecordingSleeper::default();
    let clock = ManualClock::new(start());

    let report = cycle(&workspace, &runner, &backend, &sleeper, &clock);
    assert_eq!(report.exit_code, 2);
    assert_eq!(report.status, CycleStatus::Failed);
    assert!(backend.lock_agents().is_empty());
    assert!(runner.specs().is_empty());

    let log = single_log(&workspace);
    assert_eq!(log.get("reason"), Some("Lock backend unavailable preflight"));
    assert_eq!(
        log.get("preflight_failure_category"),
        Some(classify_backend_error(error).as_str())
    );
    assert_eq!(log.get("relay_list"), Some("(none)"));
    assert_eq!(log.get("preflight_stderr_excerpt"), Some(error));
}

#[test]
fn preflight_relay_list_is_redacted() {
    let mut workspace = TestWorkspace::new(&["alpha"]).expect("workspace");
    workspace.file.lock_health_preflight.enabled = true;
    let runner = ScriptedRunner::new();
    let backend = ScriptedBackend::new().with_health(output(
        1,
        "{\"ok\":false,\"relays\":[\"wss://a.example/?token=s3cr3t\"],\"failureCategory\":\"relay_auth_required\"}",
        "",
    ));
    let sleeper = RecordingSleeper::default();
    let clock = ManualClock::new(start());

    cycle(&workspace, &runner, &backend, &sleeper, &clock);
    let log = single_log(&workspace);
    assert_eq!(
        log.get("relay_list"),
        Some("wss://a.example/?token=[REDACTED]")
    );
}

#[test]
fn internal_error_after_selection_is_recorded() {
    let workspace = TestWorkspace::new(&["alpha"]).expect("workspace");
    fs::write(workspace.path().join("memory-updates"), "not a dir").expect("block memory dir");
    let runner = ScriptedRunner::new();
    let backend = ScriptedBackend::new();
    let sleeper = RecordingSleeper::default();
    let clock = ManualClock::new(start());

    let config = workspace.config(Cadence::Daily);
    let deps = CycleDeps {
        runner: &runner,
        backend: &backend,
        sleeper: &sleeper,
        clock: &clock,
    };
    let err = run_cycle(&config, &identity(), &deps, &mut StdRng::seed_from_u64(7))
        .expect_err("memory dir is a file");
    assert!(format!("{err:#}").contains("create memory dir"));

    let log = single_log(&workspace);
    assert_eq!(log.get("status"), Some("failed"));
    assert_eq!(log.get("reason"), Some("Scheduler internal error"));
    assert_eq!(log.get("failure_category"), Some("execution_error"));
}

#[test]
fn summary_includes_learnings() {
    let workspace = TestWorkspace::new(&["alpha"]).expect("workspace");
    let runner = ScriptedRunner::new();
    let backend = ScriptedBackend::new();
    let sleeper = RecordingSleeper::default();
    let clock = ManualClock::new(start());

    let report = cycle(&workspace, &runner, &backend, &sleeper, &clock);
    let summary = report.render_summary();
    assert!(summary.contains("Status: completed"));
    assert!(summary.contains("Agent: alpha"));
    assert!(summary.contains("No learnings recorded."));

    let memory_file = report.memory_file.clone().expect("memory file");
    fs::write(&memory_file, "Relay b flakes before 09:00 UTC.\n").expect("write learnings");
    assert!(
        report
            .render_summary()
            .ends_with("Learnings / Discoveries\nRelay b flakes before 09:00 UTC.")
    );
}
