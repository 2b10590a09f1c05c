//! Built-in handoff runners keyed by agent platform.

use std::fmt;

use crate::io::process::CommandSpec;

/// Environment variable that replaces the built-in runner with a shell command.
pub const RUNNER_COMMAND_ENV: &str = "SCHEDULER_AGENT_RUNNER_COMMAND";

/// How the selected prompt is handed to an agent when no handoff command is configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Platform {
    /// `codex exec <prompt>`.
    Codex,
    /// `claude -p <prompt>`.
    Claude,
    /// Simulated run that only echoes.
    Linux,
    /// Arbitrary shell command run through `bash -lc`.
    Custom(String),
}

impl Platform {
    /// Resolve the runner for a platform label. A runner override always wins.
    ///
    /// Returns `None` for unknown labels without an override.
    pub fn resolve(label: &str, runner_override: Option<&str>) -> Option<Self> {
        if let Some(command) = runner_override.map(str::trim).filter(|c| !c.is_empty()) {
            return Some(Platform::Custom(command.to_string()));
        }
        match label.trim().to_ascii_lowercase().as_str() {
            "codex" => Some(Platform::Codex),
            "claude" => Some(Platform::Claude),
            "linux" => Some(Platform::Linux),
            _ => None,
        }
    }

    /// Command that runs `prompt` on this platform.
    pub fn handoff_spec(&self, prompt: &str) -> CommandSpec {
        match self {
            Platform::Codex => CommandSpec::new("codex").arg("exec").arg(prompt),
            Platform::Claude => CommandSpec::new("claude").arg("-p").arg(prompt),
            Platform::Linux => CommandSpec::new("echo")
                .arg("[scheduler] Platform 'linux' detected. simulated execution for prompt."),
            Platform::Custom(command) => {
                CommandSpec::shell(command).env("SCHEDULER_PROMPT_MARKDOWN", prompt)
            }
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Codex => f.write_str("codex"),
            Platform::Claude => f.write_str("claude"),
            Platform::Linux => f.write_str("linux"),
            Platform::Custom(_) => f.write_str("custom"),
        }
    }
}
