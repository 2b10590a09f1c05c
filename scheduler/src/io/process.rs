//! Helpers for running child processes with bounded output.
//!
//! Children run with a sanitized environment, and backend commands can be given
//! a private structured event channel (`SCHEDULER_EVENTS_FILE`). No timeout is
//! enforced here; backends report their own timeouts through exit codes.

use std::fs;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};

use crate::core::events::{Event, parse_json_events};

/// Environment variable naming the structured event file handed to backend commands.
pub const EVENTS_FILE_ENV: &str = "SCHEDULER_EVENTS_FILE";

const SAFE_ENV_KEYS: &[&str] = &[
    "PATH", "HOME", "USER", "SHELL", "TERM", "LANG", "LC_ALL", "LC_CTYPE", "TZ", "TMPDIR", "TEMP",
    "TMP", "EDITOR", "VISUAL", "CI",
];

const SAFE_ENV_PREFIXES: &[&str] = &[
    "GITHUB_",
    "npm_",
    "NOSTR_",
    "TORCH_",
    "SCHEDULER_",
    "AGENT_",
    "CODEX_",
    "CLAUDE_",
    "ANTHROPIC_",
    "GOOSE_",
    "JULES_",
];

/// Whether an inherited environment variable may be passed to children.
pub fn is_safe_env_key(key: &str) -> bool {
    SAFE_ENV_KEYS.contains(&key) || SAFE_ENV_PREFIXES.iter().any(|prefix| key.starts_with(prefix))
}

/// A child process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Variables set on top of the sanitized inherited environment.
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    /// Provide a fresh `SCHEDULER_EVENTS_FILE` and collect the events written to it.
    pub capture_events: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            capture_events: false,
        }
    }

    /// Split a configured command line into program and arguments.
    pub fn from_command_line(line: &str) -> Result<Self> {
        let mut words = shell_words::split(line)
            .with_context(|| format!("parse command line '{line}'"))?
            .into_iter();
        let program = words
            .next()
            .ok_or_else(|| anyhow!("empty command line"))?;
        let mut spec = Self::new(program);
        spec.args.extend(words);
        Ok(spec)
    }

    /// Run a script through `bash -lc`.
    pub fn shell(script: &str) -> Self {
        Self::new("bash").arg("-lc").arg(script)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn envs(mut self, vars: &[(String, String)]) -> Self {
        self.env.extend(vars.iter().cloned());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_events(mut self) -> Self {
        self.capture_events = true;
        self
    }

    /// Human-readable command line for logs and remediation text.
    pub fn display(&self) -> String {
        let mut words = Vec::with_capacity(self.args.len() + 1);
        words.push(self.program.as_str());
        words.extend(self.args.iter().map(String::as_str));
        shell_words::join(words)
    }
}

/// Captured child process output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    /// Exit code; termination by signal is reported as 1.
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    /// Events read from the structured channel (empty when not requested or unused).
    pub events: Vec<Event>,
}

impl CommandOutput {
    /// Failed result standing in for a command that never ran.
    pub fn launch_failure(err: &anyhow::Error) -> Self {
        Self {
            code: 1,
            stderr: format!("{err:#}"),
            ..Self::default()
        }
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// `stdout` then `stderr`, newline separated.
    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }

    /// `stderr` then `stdout`, the order diagnostics are classified in.
    pub fn diagnostics(&self) -> String {
        format!("{}\n{}", self.stderr, self.stdout)
    }
}

/// Abstraction over child process execution so cycles can be scripted in tests.
pub trait CommandRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;
}

/// Runs real child processes.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    output_limit_bytes: usize,
}

impl SystemRunner {
    pub fn new(output_limit_bytes: usize) -> Self {
        Self { output_limit_bytes }
    }
}

impl CommandRunner for SystemRunner {
    #[instrument(skip_all, fields(program = %spec.program, output_limit_bytes = self.output_limit_bytes))]
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        cmd.env_clear();
        cmd.envs(std::env::vars().filter(|(key, _)| is_safe_env_key(key)));
        cmd.envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }

        let events_file = if spec.capture_events {
            let file = tempfile::Builder::new()
                .prefix("scheduler-events-")
                .suffix(".ndjson")
                .tempfile()
                .context("create events file")?;
            cmd.env(EVENTS_FILE_ENV, file.path());
            Some(file)
        } else {
            None
        };

        let mut output = run_command(cmd, self.output_limit_bytes)?;

        if let Some(file) = events_file {
            let raw = fs::read_to_string(file.path())
                .with_context(|| format!("read events file {}", file.path().display()))?;
            output.events = parse_json_events(&raw);
            debug!(events = output.events.len(), "structured events collected");
        }
        Ok(output)
    }
}

/// Run a command and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
pub fn run_command(mut cmd: Command, output_limit_bytes: usize) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let status = child.wait().context("wait for command")?;

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    let code = status.code().unwrap_or(1);
    debug!(exit_code = code, "command finished");
    Ok(CommandOutput {
        code,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        stdout_truncated,
        stderr_truncated,
        events: Vec::new(),
    })
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
