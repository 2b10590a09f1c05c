//! Test-only collaborators for driving cycles without processes or sleeps.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use tempfile::TempDir;

use crate::core::types::Cadence;
use crate::cycle::Clock;
use crate::io::backend::LockBackend;
use crate::io::config::{ConfigFile, EnvOverrides, SchedulerConfig};
use crate::io::lock::Sleeper;
use crate::io::process::{CommandOutput, CommandRunner, CommandSpec};

/// Build a command output with the given exit code and streams.
pub fn output(code: i32, stdout: &str, stderr: &str) -> CommandOutput {
    CommandOutput {
        code,
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        ..CommandOutput::default()
    }
}

/// One recorded backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    Check,
    Lock {
        agent: String,
        env: Vec<(String, String)>,
    },
    Health,
    Complete {
        agent: String,
    },
}

/// Lock backend returning scripted outputs.
///
/// Lock and queued check outputs are consumed in order; once exhausted every
/// lock succeeds and check falls back to its fixed output. Check, health and
/// complete succeed with empty output unless scripted.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    check: CommandOutput,
    checks: RefCell<VecDeque<CommandOutput>>,
    health: CommandOutput,
    complete: CommandOutput,
    locks: RefCell<VecDeque<CommandOutput>>,
    check_error: Option<String>,
    health_error: Option<String>,
    calls: RefCell<Vec<BackendCall>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_check(mut self, output: CommandOutput) -> Self {
        self.check = output;
        self
    }

    /// Outputs for successive check calls, ahead of the fixed check output.
    pub fn with_checks(self, outputs: impl IntoIterator<Item = CommandOutput>) -> Self {
        self.checks.borrow_mut().extend(outputs);
        self
    }

    /// Make every check call fail as if the command could not be spawned.
    pub fn with_check_error(mut self, message: &str) -> Self {
        self.check_error = Some(message.to_string());
        self
    }

    /// Make every health call fail as if the command could not be spawned.
    pub fn with_health_error(mut self, message: &str) -> Self {
        self.health_error = Some(message.to_string());
        self
    }

    pub fn with_health(mut self, output: CommandOutput) -> Self {
        self.health = output;
        self
    }

    pub fn with_complete(mut self, output: CommandOutput) -> Self {
        self.complete = output;
        self
    }

    pub fn with_locks(self, outputs: impl IntoIterator<Item = CommandOutput>) -> Self {
        self.locks.borrow_mut().extend(outputs);
        self
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.borrow().clone()
    }

    /// Agents passed to `lock`, one entry per attempt.
    pub fn lock_agents(&self) -> Vec<String> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|call| match call {
                BackendCall::Lock { agent, .. } => Some(agent.clone()),
                _ => None,
            })
            .collect()
    }

    /// Value of `key` in the environment of every lock attempt.
    pub fn lock_env_values(&self, key: &str) -> Vec<Option<String>> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|call| match call {
                BackendCall::Lock { env, .. } => {
                    Some(env.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone()))
                }
                _ => None,
            })
            .collect()
    }

    pub fn complete_agents(&self) -> Vec<String> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|call| match call {
                BackendCall::Complete { agent } => Some(agent.clone()),
                _ => None,
            })
            .collect()
    }
}

impl LockBackend for ScriptedBackend {
    fn check(&self, _cadence: Cadence) -> Result<CommandOutput> {
        self.calls.borrow_mut().push(BackendCall::Check);
        if let Some(message) = &self.check_error {
            return Err(anyhow!("{message}"));
        }
        Ok(self
            .checks
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| self.check.clone()))
    }

    fn lock(
        &self,
        agent: &str,
        _cadence: Cadence,
        attempt_env: &[(String, String)],
    ) -> Result<CommandOutput> {
        self.calls.borrow_mut().push(BackendCall::Lock {
            agent: agent.to_string(),
            env: attempt_env.to_vec(),
        });
        Ok(self.locks.borrow_mut().pop_front().unwrap_or_default())
    }

    fn health(&self, _cadence: Cadence) -> Result<CommandOutput> {
        self.calls.borrow_mut().push(BackendCall::Health);
        if let Some(message) = &self.health_error {
            return Err(anyhow!("{message}"));
        }
        Ok(self.health.clone())
    }

    fn complete(&self, agent: &str, _cadence: Cadence) -> Result<CommandOutput> {
        self.calls.borrow_mut().push(BackendCall::Complete {
            agent: agent.to_string(),
        });
        Ok(self.complete.clone())
    }

    fn describe_lock(&self, agent: &str, cadence: Cadence) -> String {
        format!("lock --agent {agent} --cadence {cadence}")
    }

    fn describe_complete(&self, agent: &str, cadence: Cadence) -> String {
        format!("complete --agent {agent} --cadence {cadence}")
    }

    fn describe_health(&self, cadence: Cadence) -> String {
        format!("health --cadence {cadence}")
    }
}

/// Command runner that records every spec and answers from a rule list.
///
/// The first rule whose needle occurs in the rendered command line wins;
/// unmatched commands succeed with empty output.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    rules: Vec<(String, CommandOutput)>,
    specs: RefCell<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(mut self, needle: &str, output: CommandOutput) -> Self {
        self.rules.push((needle.to_string(), output));
        self
    }

    pub fn specs(&self) -> Vec<CommandSpec> {
        self.specs.borrow().clone()
    }

    /// Rendered command lines, in call order.
    pub fn command_lines(&self) -> Vec<String> {
        self.specs.borrow().iter().map(CommandSpec::display).collect()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.specs.borrow_mut().push(spec.clone());
        let line = spec.display();
        Ok(self
            .rules
            .iter()
            .find(|(needle, _)| line.contains(needle.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_default())
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Cell<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Cell::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        self.now.set(now);
    }

    pub fn advance(&self, by: chrono::Duration) {
        self.now.set(self.now.get() + by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.get()
    }
}

/// Sleeper that records requested delays and returns immediately.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    delays: RefCell<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.borrow().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, delay: Duration) {
        self.delays.borrow_mut().push(delay);
    }
}

/// Temporary scheduler root with a roster, prompts and an in-memory config file.
pub struct TestWorkspace {
    dir: TempDir,
    pub file: ConfigFile,
}

impl TestWorkspace {
    /// Roster `daily` agents, each with a valid prompt. Validation commands are
    /// cleared and lock jitter is zeroed so backoff delays are deterministic.
    pub fn new(daily: &[&str]) -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp dir")?;
        let mut file = ConfigFile::default();
        file.lock_retry.jitter_ms = 0;
        file.cadences.daily.validation_commands.clear();
        file.cadences.weekly.validation_commands.clear();
        let workspace = Self { dir, file };

        let roster = serde_json::json!({ "daily": daily, "weekly": [] });
        let roster_path = workspace.path().join(&workspace.file.roster_path);
        if let Some(parent) = roster_path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&roster_path, roster.to_string())
            .with_context(|| format!("write {}", roster_path.display()))?;
        for agent in daily {
            workspace.write_prompt(Cadence::Daily, agent, &format!("# {agent}\n\nDo the work.\n"))?;
        }
        Ok(workspace)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Resolve the config for `cadence` with no environment overrides.
    pub fn config(&self, cadence: Cadence) -> SchedulerConfig {
        SchedulerConfig::resolve(&self.file, &EnvOverrides::default(), cadence, self.path())
    }

    pub fn write_prompt(&self, cadence: Cadence, agent: &str, contents: &str) -> Result<()> {
        let dir = self
            .path()
            .join(&self.file.prompts_dir)
            .join(cadence.as_str());
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        let path = dir.join(format!("{agent}.md"));
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    /// Task log files for `cadence`, sorted by name.
    pub fn task_logs(&self, cadence: Cadence) -> Vec<PathBuf> {
        let dir = self.config(cadence).log_dir;
        let mut logs: Vec<PathBuf> = fs::read_dir(&dir)
            .map(|entries| {
                entries
                    .flatten()
                    .map(|entry| entry.path())
                    .filter(|path| path.extension().is_some_and(|ext| ext == "md"))
                    .collect()
            })
            .unwrap_or_default();
        logs.sort();
        logs
    }
}
