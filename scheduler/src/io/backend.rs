//! Lock backend abstraction.
//!
//! The [`LockBackend`] trait decouples cycle orchestration from the external
//! relay lock commands. Tests use scripted backends that return predetermined
//! outputs without spawning processes.

use std::path::PathBuf;

use anyhow::Result;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::events::{Event, parse_json_events, parse_json_from_output};
use crate::core::types::Cadence;
use crate::io::config::BackendCommands;
use crate::io::process::{CommandOutput, CommandRunner, CommandSpec};

/// Lock exit code: claim acquired.
pub const LOCK_ACQUIRED: i32 = 0;
/// Lock exit code: relay/backend error, retryable.
pub const LOCK_BACKEND_ERROR: i32 = 2;
/// Lock exit code: another scheduler already holds this claim.
pub const LOCK_ALREADY_CLAIMED: i32 = 3;

/// Operations exposed by the external lock backend.
pub trait LockBackend {
    /// Query claimed agents for the cadence.
    fn check(&self, cadence: Cadence) -> Result<CommandOutput>;

    /// Attempt to claim `agent`. `attempt_env` carries per-attempt correlation variables.
    fn lock(
        &self,
        agent: &str,
        cadence: Cadence,
        attempt_env: &[(String, String)],
    ) -> Result<CommandOutput>;

    /// Probe relay health before selection.
    fn health(&self, cadence: Cadence) -> Result<CommandOutput>;

    /// Publish completion for `agent`.
    fn complete(&self, agent: &str, cadence: Cadence) -> Result<CommandOutput>;

    /// Operator-facing lock command line, for remediation text.
    fn describe_lock(&self, agent: &str, cadence: Cadence) -> String;

    /// Operator-facing complete command line, for remediation text.
    fn describe_complete(&self, agent: &str, cadence: Cadence) -> String;

    /// Operator-facing health-check command line, for remediation text.
    fn describe_health(&self, cadence: Cadence) -> String;
}

/// Lock backend driven by configured command lines.
pub struct CommandLockBackend<'r, R: CommandRunner> {
    runner: &'r R,
    commands: BackendCommands,
    cwd: PathBuf,
    platform: String,
    model: Option<String>,
}

impl<'r, R: CommandRunner> CommandLockBackend<'r, R> {
    pub fn new(
        runner: &'r R,
        commands: BackendCommands,
        cwd: PathBuf,
        platform: &str,
        model: Option<&str>,
    ) -> Self {
        Self {
            runner,
            commands,
            cwd,
            platform: platform.to_string(),
            model: model.map(str::to_string),
        }
    }

    fn agent_spec(&self, line: &str, agent: &str, cadence: Cadence) -> Result<CommandSpec> {
        let mut spec = CommandSpec::from_command_line(line)?
            .arg("--agent")
            .arg(agent)
            .arg("--cadence")
            .arg(cadence.as_str());
        if let Some(model) = &self.model {
            spec = spec.arg("--model").arg(model.as_str());
        }
        Ok(self.with_identity(spec))
    }

    fn cadence_spec(&self, line: &str, cadence: Cadence) -> Result<CommandSpec> {
        let spec = CommandSpec::from_command_line(line)?
            .arg("--cadence")
            .arg(cadence.as_str());
        Ok(self.with_identity(spec))
    }

    fn with_identity(&self, spec: CommandSpec) -> CommandSpec {
        let mut spec = spec
            .cwd(self.cwd.clone())
            .env("AGENT_PLATFORM", self.platform.as_str())
            .with_events();
        if let Some(model) = &self.model {
            spec = spec.env("AGENT_MODEL", model.as_str());
        }
        spec
    }

    fn display_with_identity(&self, spec: &CommandSpec) -> String {
        format!("AGENT_PLATFORM={} {}", self.platform, spec.display())
    }
}

impl<R: CommandRunner> LockBackend for CommandLockBackend<'_, R> {
    #[instrument(skip_all, fields(cadence = %cadence))]
    fn check(&self, cadence: Cadence) -> Result<CommandOutput> {
        let spec = self.cadence_spec(&self.commands.check, cadence)?;
        debug!(command = %spec.display(), "running lock check");
        self.runner.run(&spec)
    }

    #[instrument(skip_all, fields(agent = %agent, cadence = %cadence))]
    fn lock(
        &self,
        agent: &str,
        cadence: Cadence,
        attempt_env: &[(String, String)],
    ) -> Result<CommandOutput> {
        let spec = self
            .agent_spec(&self.commands.lock, agent, cadence)?
            .envs(attempt_env);
        debug!(command = %spec.display(), "running lock");
        self.runner.run(&spec)
    }

    #[instrument(skip_all, fields(cadence = %cadence))]
    fn health(&self, cadence: Cadence) -> Result<CommandOutput> {
        let spec = self.cadence_spec(&self.commands.health, cadence)?;
        debug!(command = %spec.display(), "running lock health preflight");
        self.runner.run(&spec)
    }

    #[instrument(skip_all, fields(agent = %agent, cadence = %cadence))]
    fn complete(&self, agent: &str, cadence: Cadence) -> Result<CommandOutput> {
        let spec = self.agent_spec(&self.commands.complete, agent, cadence)?;
        debug!(command = %spec.display(), "publishing completion");
        self.runner.run(&spec)
    }

    fn describe_lock(&self, agent: &str, cadence: Cadence) -> String {
        match self.agent_spec(&self.commands.lock, agent, cadence) {
            Ok(spec) => self.display_with_identity(&spec),
            Err(_) => self.commands.lock.clone(),
        }
    }

    fn describe_complete(&self, agent: &str, cadence: Cadence) -> String {
        match self.agent_spec(&self.commands.complete, agent, cadence) {
            Ok(spec) => self.display_with_identity(&spec),
            Err(_) => self.commands.complete.clone(),
        }
    }

    fn describe_health(&self, cadence: Cadence) -> String {
        match self.cadence_spec(&self.commands.health, cadence) {
            Ok(spec) => spec.display(),
            Err(_) => self.commands.health.clone(),
        }
    }
}

/// Machine-readable payload of a backend call.
///
/// The last event on the structured channel wins; without one, fall back to the
/// last JSON line of `stdout` + `stderr`.
pub fn structured_payload(output: &CommandOutput) -> Option<Value> {
    if let Some(event) = output.events.last() {
        return Some(Value::Object(event.clone()));
    }
    parse_json_from_output(&output.combined())
}

/// Diagnostic events of a backend call: the structured channel when used, else
/// JSON object lines scraped from `stderr` + `stdout`.
pub fn diagnostic_events(output: &CommandOutput) -> Vec<Event> {
    if !output.events.is_empty() {
        return output.events.clone();
    }
    parse_json_events(&output.diagnostics())
}
