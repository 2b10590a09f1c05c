//! Scheduler configuration stored in `scheduler.toml`.
//!
//! The file is resolved once per cycle into an immutable [`SchedulerConfig`]
//! for a single cadence, with explicit environment overrides applied on top.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::deferral::DeferralPolicy;
use crate::core::types::Cadence;

/// Default config file name, relative to the working root.
pub const DEFAULT_CONFIG_FILE: &str = "scheduler.toml";

/// Scheduler configuration file (TOML).
///
/// Missing fields fall back to defaults so an absent or partial file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConfigFile {
    /// Roster JSON (`{"daily": [...], "weekly": [...]}`), relative to the root.
    pub roster_path: PathBuf,
    /// Prompt root; prompts live at `<prompts_dir>/<cadence>/<agent>.md`.
    pub prompts_dir: PathBuf,
    /// Task-log root; each cadence writes to `<log_root>/<cadence>/`.
    pub log_root: PathBuf,
    /// Directory for per-run memory update files handed to agents.
    pub memory_dir: PathBuf,
    /// Truncate captured child stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
    /// Optional external run-artifact verifier command.
    pub artifact_verifier: Option<String>,
    pub backend: BackendCommands,
    pub lock_retry: LockRetryPolicy,
    pub lock_health_preflight: PreflightFile,
    pub lock_failure_policy: LockFailurePolicyFile,
    pub cadences: CadenceTable,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            roster_path: PathBuf::from("prompts/roster.json"),
            prompts_dir: PathBuf::from("prompts"),
            log_root: PathBuf::from("task-logs"),
            memory_dir: PathBuf::from("memory-updates"),
            output_limit_bytes: 100_000,
            artifact_verifier: None,
            backend: BackendCommands::default(),
            lock_retry: LockRetryPolicy::default(),
            lock_health_preflight: PreflightFile::default(),
            lock_failure_policy: LockFailurePolicyFile::default(),
            cadences: CadenceTable::default(),
        }
    }
}

/// Command lines for the external lock backend. Arguments are appended per call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackendCommands {
    pub check: String,
    pub lock: String,
    pub health: String,
    pub complete: String,
}

impl Default for BackendCommands {
    fn default() -> Self {
        Self {
            check: "npm run lock:check -- --json --quiet".to_string(),
            lock: "npm run lock:lock --".to_string(),
            health: "npm run lock:health -- --json".to_string(),
            complete: "npm run lock:complete --".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LockRetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub jitter_ms: u64,
}

impl Default for LockRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_ms: 250,
            jitter_ms: 75,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PreflightFile {
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LockFailurePolicyFile {
    pub strict_lock: bool,
    pub degraded_lock_retry_window_ms: u64,
    pub max_deferrals: u32,
}

impl Default for LockFailurePolicyFile {
    fn default() -> Self {
        Self {
            strict_lock: true,
            degraded_lock_retry_window_ms: 3_600_000,
            max_deferrals: 3,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CadenceTable {
    pub daily: CadenceConfig,
    pub weekly: CadenceConfig,
}

impl CadenceTable {
    pub fn get(&self, cadence: Cadence) -> &CadenceConfig {
        match cadence {
            Cadence::Daily => &self.daily,
            Cadence::Weekly => &self.weekly,
        }
    }
}

/// Per-cadence settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CadenceConfig {
    /// Shell command run via `bash -lc` instead of the built-in platform runner.
    pub handoff_command: Option<String>,
    /// Commands that must all pass before completion is published.
    pub validation_commands: Vec<String>,
    /// Agent to start from when no previous run is recorded.
    pub first_prompt: Option<String>,
    pub memory_policy: MemoryPolicy,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            handoff_command: None,
            validation_commands: vec!["npm run lint".to_string()],
            first_prompt: None,
            memory_policy: MemoryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MemoryMode {
    #[default]
    Optional,
    Required,
}

/// How memory retrieve/store steps are run and verified.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MemoryPolicy {
    pub mode: MemoryMode,
    pub retrieve_command: Option<String>,
    pub store_command: Option<String>,
    pub retrieve_success_markers: Vec<String>,
    pub store_success_markers: Vec<String>,
    /// Files (relative to the root) whose fresh modification proves retrieval.
    pub retrieve_artifacts: Vec<String>,
    pub store_artifacts: Vec<String>,
}

impl Default for MemoryPolicy {
    fn default() -> Self {
        Self {
            mode: MemoryMode::Optional,
            retrieve_command: None,
            store_command: None,
            retrieve_success_markers: vec!["MEMORY_RETRIEVED".to_string()],
            store_success_markers: vec!["MEMORY_STORED".to_string()],
            retrieve_artifacts: Vec::new(),
            store_artifacts: Vec::new(),
        }
    }
}

impl ConfigFile {
    pub fn validate(&self) -> Result<()> {
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        for (name, command) in [
            ("backend.check", &self.backend.check),
            ("backend.lock", &self.backend.lock),
            ("backend.health", &self.backend.health),
            ("backend.complete", &self.backend.complete),
        ] {
            let words = shell_words::split(command)
                .with_context(|| format!("{name} is not a valid command line"))?;
            if words.is_empty() {
                return Err(anyhow!("{name} must be a non-empty command"));
            }
        }
        for cadence in [Cadence::Daily, Cadence::Weekly] {
            let cfg = self.cadences.get(cadence);
            for command in &cfg.validation_commands {
                shell_words::split(command).with_context(|| {
                    format!("cadences.{cadence}.validation_commands entry '{command}' is invalid")
                })?;
            }
            if cfg
                .first_prompt
                .as_deref()
                .is_some_and(|agent| agent.trim().is_empty())
            {
                return Err(anyhow!("cadences.{cadence}.first_prompt must not be empty"));
            }
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ConfigFile::default()`.
pub fn load_config(path: &Path) -> Result<ConfigFile> {
    if !path.exists() {
        debug!(path = %path.display(), "config file missing, using defaults");
        let cfg = ConfigFile::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ConfigFile =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Environment overrides, read once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub max_retries: Option<u32>,
    pub backoff_ms: Option<u64>,
    pub jitter_ms: Option<u64>,
    pub preflight_enabled: Option<bool>,
    pub skip_preflight: Option<bool>,
    pub strict_lock: Option<bool>,
    pub retry_window_ms: Option<u64>,
    pub max_deferrals: Option<u32>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build overrides from an arbitrary lookup. Unparseable values are ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let number = |key: &str| lookup(key).and_then(|raw| parse_non_negative(key, &raw));
        let flag = |key: &str| lookup(key).and_then(|raw| parse_bool_flag(key, &raw));
        Self {
            max_retries: number("SCHEDULER_LOCK_MAX_RETRIES").and_then(|v| u32::try_from(v).ok()),
            backoff_ms: number("SCHEDULER_LOCK_BACKOFF_MS"),
            jitter_ms: number("SCHEDULER_LOCK_JITTER_MS"),
            preflight_enabled: flag("SCHEDULER_LOCK_HEALTH_PREFLIGHT"),
            skip_preflight: flag("SCHEDULER_SKIP_LOCK_HEALTH_PREFLIGHT"),
            strict_lock: flag("SCHEDULER_STRICT_LOCK"),
            retry_window_ms: number("SCHEDULER_DEGRADED_LOCK_RETRY_WINDOW_MS"),
            max_deferrals: number("SCHEDULER_MAX_DEFERRALS").and_then(|v| u32::try_from(v).ok()),
        }
    }
}

fn parse_non_negative(key: &str, raw: &str) -> Option<u64> {
    let parsed = raw.trim().parse::<u64>().ok();
    if parsed.is_none() {
        warn!(key, value = raw, "ignoring non-numeric override");
    }
    parsed
}

fn parse_bool_flag(key: &str, raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warn!(key, value = raw, "ignoring non-boolean override");
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreflightPolicy {
    pub enabled: bool,
    pub skip: bool,
}

impl PreflightPolicy {
    pub fn should_run(self) -> bool {
        self.enabled && !self.skip
    }
}

/// Immutable configuration for one cadence cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub cadence: Cadence,
    pub root: PathBuf,
    pub roster_path: PathBuf,
    pub prompts_dir: PathBuf,
    /// `<log_root>/<cadence>`.
    pub log_dir: PathBuf,
    pub memory_dir: PathBuf,
    pub output_limit_bytes: usize,
    pub artifact_verifier: Option<String>,
    pub backend: BackendCommands,
    pub handoff_command: Option<String>,
    pub validation_commands: Vec<String>,
    pub first_prompt: Option<String>,
    pub lock_retry: LockRetryPolicy,
    pub preflight: PreflightPolicy,
    pub deferral: DeferralPolicy,
    pub memory: MemoryPolicy,
}

impl SchedulerConfig {
    pub fn resolve(file: &ConfigFile, env: &EnvOverrides, cadence: Cadence, root: &Path) -> Self {
        let per_cadence = file.cadences.get(cadence);
        let failure = &file.lock_failure_policy;
        let retry_window_ms = env
            .retry_window_ms
            .unwrap_or(failure.degraded_lock_retry_window_ms);

        Self {
            cadence,
            root: root.to_path_buf(),
            roster_path: root.join(&file.roster_path),
            prompts_dir: root.join(&file.prompts_dir),
            log_dir: root.join(&file.log_root).join(cadence.as_str()),
            memory_dir: root.join(&file.memory_dir),
            output_limit_bytes: file.output_limit_bytes,
            artifact_verifier: non_blank(file.artifact_verifier.as_deref()),
            backend: file.backend.clone(),
            handoff_command: non_blank(per_cadence.handoff_command.as_deref()),
            validation_commands: per_cadence
                .validation_commands
                .iter()
                .map(|cmd| cmd.trim().to_string())
                .filter(|cmd| !cmd.is_empty())
                .collect(),
            first_prompt: non_blank(per_cadence.first_prompt.as_deref()),
            lock_retry: LockRetryPolicy {
                max_retries: env.max_retries.unwrap_or(file.lock_retry.max_retries),
                backoff_ms: env.backoff_ms.unwrap_or(file.lock_retry.backoff_ms),
                jitter_ms: env.jitter_ms.unwrap_or(file.lock_retry.jitter_ms),
            },
            preflight: PreflightPolicy {
                enabled: env
                    .preflight_enabled
                    .unwrap_or(file.lock_health_preflight.enabled),
                skip: env.skip_preflight.unwrap_or(false),
            },
            deferral: DeferralPolicy {
                strict_lock: env.strict_lock.unwrap_or(failure.strict_lock),
                retry_window: Duration::milliseconds(
                    i64::try_from(retry_window_ms).unwrap_or(i64::MAX),
                ),
                max_deferrals: env.max_deferrals.unwrap_or(failure.max_deferrals),
            },
            memory: per_cadence.memory_policy.clone(),
        }
    }

    /// Retry window rounded to whole minutes, for remediation text.
    pub fn retry_window_minutes(&self) -> i64 {
        self.deferral
            .retry_window
            .num_milliseconds()
            .saturating_add(30_000)
            / 60_000
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
