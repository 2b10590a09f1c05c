//! Strictly ordered execution of a claimed agent.
//!
//! Prompt → memory retrieve → handoff → memory store → validation → memory
//! evidence → artifact verifier → completion publish. Each step is a hard gate:
//! the first failure produces the cycle's terminal record and nothing after it
//! runs. Completion is only published after every gate passed, and a
//! `completed` record is only produced after completion was published.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use crate::core::redact::{excerpt, redact};
use crate::core::remediation::remediation_text;
use crate::core::types::{BACKEND_UNAVAILABLE, FailureCategory, LogStatus, iso_timestamp};
use crate::exit_codes;
use crate::io::backend::LockBackend;
use crate::io::config::{MemoryMode, SchedulerConfig};
use crate::io::memory::{compose_prompt, prepare_memory_file, verify_memory_step};
use crate::io::platform::{Platform, RUNNER_COMMAND_ENV};
use crate::io::process::{CommandOutput, CommandRunner, CommandSpec};
use crate::io::prompt::{prompt_path, validate_prompt};
use crate::io::task_log::TaskLogRecord;

/// Failure class written next to `execution_error` for pipeline step failures.
const PROMPT_VALIDATION_ERROR: &str = "prompt_validation_error";

/// Who runs the prompt: the platform label, optional model, optional runner override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    /// `AGENT_PLATFORM` label, recorded verbatim in task logs.
    pub platform: String,
    pub model: Option<String>,
    /// `SCHEDULER_AGENT_RUNNER_COMMAND`.
    pub runner_override: Option<String>,
}

impl AgentIdentity {
    pub fn new(platform: &str, model: Option<&str>) -> Self {
        Self {
            platform: platform.trim().to_string(),
            model: model
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(str::to_string),
            runner_override: None,
        }
    }

    pub fn with_runner_override(mut self, command: Option<&str>) -> Self {
        self.runner_override = command
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string);
        self
    }
}

/// Terminal result of the pipeline. The caller writes `record`.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub record: TaskLogRecord,
    pub exit_code: i32,
    pub prompt_path: PathBuf,
    /// Per-run memory file handed to the agent, once it was prepared.
    pub memory_file: Option<PathBuf>,
}

impl PipelineOutcome {
    pub fn completed(&self) -> bool {
        self.record.status == LogStatus::Completed
    }
}

/// Run the pipeline for `agent`, which the caller has already claimed.
///
/// Only unexpected errors (spawn failures, unwritable directories) are returned
/// as `Err`; every step failure is an outcome.
#[instrument(skip_all, fields(agent = %agent, cadence = %config.cadence))]
pub fn run_pipeline<R: CommandRunner, B: LockBackend>(
    config: &SchedulerConfig,
    identity: &AgentIdentity,
    agent: &str,
    started_at: DateTime<Utc>,
    runner: &R,
    backend: &B,
) -> Result<PipelineOutcome> {
    let cadence = config.cadence;
    let prompt_path = prompt_path(&config.prompts_dir, cadence, agent);
    let outcome = |record: TaskLogRecord, exit_code: i32, memory_file: Option<&Path>| {
        PipelineOutcome {
            record,
            exit_code,
            prompt_path: prompt_path.clone(),
            memory_file: memory_file.map(Path::to_path_buf),
        }
    };
    let failed = |reason: &str| {
        TaskLogRecord::failed(cadence, agent, &identity.platform, reason)
            .meta_opt("model", identity.model.as_deref())
    };

    let prompt = match validate_prompt(&prompt_path) {
        Ok(prompt) => prompt,
        Err(rejection) => {
            warn!(category = %rejection.category, path = %prompt_path.display(), "prompt rejected");
            let record = failed(rejection.reason)
                .detail(rejection.detail)
                .category(rejection.category)
                .meta("prompt_path", prompt_path.display());
            return Ok(outcome(record, exit_codes::FAILURE, None));
        }
    };

    let memory_file = prepare_memory_file(&config.memory_dir, agent, started_at)?;
    let mut step_env = vec![
        ("AGENT_PLATFORM".to_string(), identity.platform.clone()),
        ("SCHEDULER_AGENT".to_string(), agent.to_string()),
        ("SCHEDULER_CADENCE".to_string(), cadence.as_str().to_string()),
        (
            "SCHEDULER_PROMPT_PATH".to_string(),
            prompt_path.display().to_string(),
        ),
        (
            "SCHEDULER_MEMORY_FILE".to_string(),
            memory_file.display().to_string(),
        ),
    ];
    if let Some(model) = &identity.model {
        step_env.push(("AGENT_MODEL".to_string(), model.clone()));
    }
    let shell_step = |script: &str| {
        CommandSpec::shell(script)
            .envs(&step_env)
            .cwd(config.root.clone())
    };
    let step_failure = |reason: &str, detail: &str, output: &CommandOutput| {
        failed(reason)
            .detail(redact(detail))
            .category(FailureCategory::Execution)
            .meta("failure_class", PROMPT_VALIDATION_ERROR)
            .meta("exit_code", output.code)
            .meta("stderr_excerpt", excerpt(&output.stderr))
            .meta("stdout_excerpt", excerpt(&output.stdout))
    };

    let mut transcript = String::new();

    if let Some(command) = &config.memory.retrieve_command {
        let output = runner.run(&shell_step(command))?;
        if !output.success() {
            let record = step_failure("Memory retrieval command failed", command, &output);
            return Ok(outcome(record, output.code, Some(&memory_file)));
        }
        transcript.push_str(&output.combined());
    }

    let composed = compose_prompt(&prompt, &config.root, cadence);
    let handoff = match &config.handoff_command {
        Some(command) => shell_step(command).env("SCHEDULER_PROMPT_MARKDOWN", composed.as_str()),
        None => {
            let Some(platform) =
                Platform::resolve(&identity.platform, identity.runner_override.as_deref())
            else {
                let record = failed("Prompt/handoff execution failed")
                    .detail(format!(
                        "Unsupported AGENT_PLATFORM={}. Set {RUNNER_COMMAND_ENV} or configure a handoff_command.",
                        identity.platform
                    ))
                    .category(FailureCategory::Execution)
                    .meta("failure_class", PROMPT_VALIDATION_ERROR);
                return Ok(outcome(record, exit_codes::FAILURE, Some(&memory_file)));
            };
            platform
                .handoff_spec(&composed)
                .envs(&step_env)
                .cwd(config.root.clone())
        }
    };
    info!(command = %handoff.program, "handing prompt to agent");
    let output = runner.run(&handoff)?;
    if !output.success() {
        let record = step_failure(
            "Prompt/handoff execution failed",
            "Handoff callback failed.",
            &output,
        );
        return Ok(outcome(record, output.code, Some(&memory_file)));
    }
    transcript.push_str(&output.combined());

    if let Some(command) = &config.memory.store_command {
        let output = runner.run(&shell_step(command))?;
        if !output.success() {
            let record = step_failure("Memory storage command failed", command, &output);
            return Ok(outcome(record, output.code, Some(&memory_file)));
        }
        transcript.push_str(&output.combined());
    }

    for command in &config.validation_commands {
        let output = runner.run(&shell_step(command))?;
        if !output.success() {
            warn!(command = %command, exit_code = output.code, "validation failed");
            let record = step_failure("Validation failed", command, &output);
            return Ok(outcome(record, output.code, Some(&memory_file)));
        }
    }

    let since = SystemTime::from(started_at);
    let policy = &config.memory;
    let checks = [
        verify_memory_step(
            "retrieve",
            &policy.retrieve_success_markers,
            &policy.retrieve_artifacts,
            &transcript,
            &config.root,
            since,
        ),
        verify_memory_step(
            "store",
            &policy.store_success_markers,
            &policy.store_artifacts,
            &transcript,
            &config.root,
            since,
        ),
    ];
    let missing: Vec<&str> = checks
        .iter()
        .filter(|check| !check.complete())
        .map(|check| check.name)
        .collect();
    if !missing.is_empty() {
        match policy.mode {
            MemoryMode::Required => {
                let record = failed("Required memory steps not verified")
                    .detail(format!("Missing evidence for: {}", missing.join(", ")))
                    .category(FailureCategory::MemoryPolicy)
                    .meta("memory_policy_mode", "required");
                return Ok(outcome(record, exit_codes::FAILURE, Some(&memory_file)));
            }
            MemoryMode::Optional => {
                warn!(missing = %missing.join(", "), "memory evidence missing (optional policy)");
            }
        }
    }

    if let Some(verifier) = &config.artifact_verifier {
        let run_start = iso_timestamp(started_at);
        let spec = CommandSpec::from_command_line(verifier)?
            .arg("--since")
            .arg(run_start.as_str())
            .arg("--agent")
            .arg(agent)
            .arg("--cadence")
            .arg(cadence.as_str())
            .arg("--prompt-path")
            .arg(prompt_path.display().to_string())
            .arg("--run-start")
            .arg(run_start.as_str())
            .arg("--check-failure-notes")
            .envs(&step_env)
            .cwd(config.root.clone());
        let output = runner.run(&spec)?;
        if !output.success() {
            let detail = [output.stderr.trim(), output.stdout.trim()]
                .into_iter()
                .find(|text| !text.is_empty())
                .map(excerpt)
                .unwrap_or_else(|| "Artifact verification failed.".to_string());
            let record = failed("Missing required run artifacts")
                .detail(detail)
                .category(FailureCategory::ArtifactVerification)
                .meta("exit_code", output.code);
            return Ok(outcome(record, output.code, Some(&memory_file)));
        }
    }

    let output = backend.complete(agent, cadence)?;
    if !output.success() {
        let complete_command = backend.describe_complete(agent, cadence);
        let remediation = remediation_text(
            &complete_command,
            &backend.describe_health(cadence),
            config.retry_window_minutes(),
            config.deferral.max_deferrals,
        );
        let record = failed("Completion publish failed")
            .detail(format!(
                "Completion publish failed. Retry {complete_command} after verifying relay connectivity. {remediation}"
            ))
            .category(FailureCategory::LockBackend)
            .meta("failure_class", BACKEND_UNAVAILABLE)
            .meta("exit_code", output.code)
            .meta("complete_stderr_excerpt", excerpt(&output.stderr))
            .meta("complete_stdout_excerpt", excerpt(&output.stdout));
        return Ok(outcome(record, output.code, Some(&memory_file)));
    }

    let record = TaskLogRecord::new(
        cadence,
        agent,
        LogStatus::Completed,
        &identity.platform,
        "Scheduler cycle completed successfully",
    )
    .meta_opt("model", identity.model.as_deref())
    .meta("prompt_path", prompt_path.display())
    .meta("memory_file", memory_file.display());
    Ok(outcome(record, exit_codes::OK, Some(&memory_file)))
}
