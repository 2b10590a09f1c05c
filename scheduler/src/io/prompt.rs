//! Prompt file resolution and structural validation.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::core::types::{Cadence, FailureCategory};

/// `<prompts_dir>/<cadence>/<agent>.md`.
pub fn prompt_path(prompts_dir: &Path, cadence: Cadence, agent: &str) -> PathBuf {
    prompts_dir.join(cadence.as_str()).join(format!("{agent}.md"))
}

/// Why a prompt cannot be executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRejection {
    pub category: FailureCategory,
    pub reason: &'static str,
    pub detail: String,
}

/// Read the prompt and check its shape.
///
/// The first non-empty line must be a Markdown heading (`#`) or blockquote (`>`).
/// Returns the prompt text on success.
pub fn validate_prompt(path: &Path) -> Result<String, PromptRejection> {
    let content = fs::read_to_string(path).map_err(|err| PromptRejection {
        category: FailureCategory::PromptParse,
        reason: "Prompt file parse/read failed",
        detail: format!(
            "Prompt not executed; unable to read prompt file at {}: {err}",
            path.display()
        ),
    })?;

    let first_line = content
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default();
    if !first_line.starts_with('#') && !first_line.starts_with('>') {
        return Err(PromptRejection {
            category: FailureCategory::PromptSchema,
            reason: "Prompt file schema validation failed",
            detail: format!(
                "Prompt not executed; expected markdown heading or blockquote on first non-empty line in {}.",
                path.display()
            ),
        });
    }

    debug!(path = %path.display(), bytes = content.len(), "prompt validated");
    Ok(content)
}
