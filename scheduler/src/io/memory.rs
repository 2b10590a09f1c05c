//! Memory retrieve/store evidence checks.
//!
//! A memory step counts as done when its output carries a success marker or
//! one of its declared artifact files was modified during this run.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::core::exclusion::FILENAME_TIMESTAMP_FORMAT;
use crate::core::types::Cadence;

/// Evidence found for one memory step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryStepCheck {
    pub name: &'static str,
    pub marker_matched: bool,
    pub artifact_matched: bool,
}

impl MemoryStepCheck {
    pub fn complete(&self) -> bool {
        self.marker_matched || self.artifact_matched
    }
}

/// Look for a marker in `output` or a fresh artifact under `root`.
pub fn verify_memory_step(
    name: &'static str,
    markers: &[String],
    artifacts: &[String],
    output: &str,
    root: &Path,
    since: SystemTime,
) -> MemoryStepCheck {
    MemoryStepCheck {
        name,
        marker_matched: markers
            .iter()
            .any(|marker| !marker.is_empty() && output.contains(marker.as_str())),
        artifact_matched: artifacts
            .iter()
            .any(|artifact| artifact_modified_since(&root.join(artifact), since)),
    }
}

fn artifact_modified_since(path: &Path, since: SystemTime) -> bool {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .is_ok_and(|modified| modified >= since)
}

/// Create the memory directory and return the per-run memory file path handed to the agent.
pub fn prepare_memory_file(memory_dir: &Path, agent: &str, started_at: DateTime<Utc>) -> Result<PathBuf> {
    fs::create_dir_all(memory_dir)
        .with_context(|| format!("create memory dir {}", memory_dir.display()))?;
    Ok(memory_dir.join(format!(
        "{}__{agent}.md",
        started_at.format(FILENAME_TIMESTAMP_FORMAT)
    )))
}

/// Latest retrieved memories for a cadence, written by the retrieve step.
pub fn retrieved_memories_path(root: &Path, cadence: Cadence) -> PathBuf {
    root.join(".scheduler-memory")
        .join("latest")
        .join(cadence.as_str())
        .join("memories.md")
}

/// Append retrieved memories to the prompt when the retrieve step left any.
pub fn compose_prompt(prompt: &str, root: &Path, cadence: Cadence) -> String {
    let memories = fs::read_to_string(retrieved_memories_path(root, cadence)).unwrap_or_default();
    let memories = memories.trim();
    if memories.is_empty() {
        return prompt.to_string();
    }
    format!("{}\n\n# Retrieved Memories\n\n{memories}\n", prompt.trim_end())
}

const LEARNINGS_MAX_CHARS: usize = 2000;

/// Learnings recorded by the agent, capped for the run summary.
pub fn read_learnings(path: &Path) -> Option<String> {
    let contents = fs::read_to_string(path).ok()?;
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.chars().count() <= LEARNINGS_MAX_CHARS {
        return Some(trimmed.to_string());
    }
    let mut cut: String = trimmed.chars().take(LEARNINGS_MAX_CHARS).collect();
    cut.push_str("\n... (truncated)");
    Some(cut)
}
