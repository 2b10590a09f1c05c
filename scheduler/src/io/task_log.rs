//! Task-log records under `<log_root>/<cadence>/`.
//!
//! Each terminal cycle outcome is one Markdown file named
//! `<ts>__<agent>__<status>.md` with a flat YAML frontmatter block followed by
//! a bullet list repeating the same fields. Files are written once and never
//! rewritten. The same directory is scanned to rebuild rotation history.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::core::exclusion::{
    FILENAME_TIMESTAMP_FORMAT, LogEntry, parse_created_at, parse_strict_log_name,
};
use crate::core::frontmatter::{self, quote_scalar};
use crate::core::types::{Cadence, FailureCategory, LogStatus, iso_timestamp};

/// One terminal cycle outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskLogRecord {
    pub cadence: Cadence,
    pub agent: String,
    pub status: LogStatus,
    pub reason: String,
    pub detail: Option<String>,
    /// Ordered metadata; `platform` always comes first.
    pub metadata: Vec<(String, String)>,
}

impl TaskLogRecord {
    pub fn new(
        cadence: Cadence,
        agent: &str,
        status: LogStatus,
        platform: &str,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            cadence,
            agent: agent.to_string(),
            status,
            reason: reason.into(),
            detail: None,
            metadata: vec![("platform".to_string(), platform.to_string())],
        }
    }

    pub fn failed(cadence: Cadence, agent: &str, platform: &str, reason: impl Into<String>) -> Self {
        Self::new(cadence, agent, LogStatus::Failed, platform, reason)
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        self.detail = (!detail.trim().is_empty()).then_some(detail);
        self
    }

    pub fn category(self, category: FailureCategory) -> Self {
        self.meta("failure_category", category.as_str())
    }

    /// Append a metadata field. Empty values are dropped; an existing key is replaced in place.
    pub fn meta(mut self, key: &str, value: impl ToString) -> Self {
        let value = value.to_string();
        if value.is_empty() {
            return self;
        }
        match self.metadata.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => self.metadata.push((key.to_string(), value)),
        }
        self
    }

    pub fn meta_opt(self, key: &str, value: Option<impl ToString>) -> Self {
        match value {
            Some(value) => self.meta(key, value),
            None => self,
        }
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Render the record as written to disk.
    pub fn render(&self, created_at: DateTime<Utc>) -> String {
        let created_at = iso_timestamp(created_at);
        let mut lines = vec![
            "---".to_string(),
            format!("cadence: {}", self.cadence),
            format!("agent: {}", self.agent),
            format!("status: {}", self.status),
            format!("reason: {}", quote_scalar(&single_line(&self.reason))),
        ];
        if let Some(detail) = &self.detail {
            lines.push(format!("detail: {}", quote_scalar(&single_line(detail))));
        }
        lines.push(format!("created_at: {created_at}"));
        lines.push(format!("timestamp: {created_at}"));
        for (key, value) in &self.metadata {
            lines.push(format!("{key}: {}", quote_scalar(&single_line(value))));
        }
        lines.push("---".to_string());
        lines.push(String::new());
        lines.push(format!("# Scheduler {}", self.status));
        lines.push(String::new());
        lines.push(format!("- reason: {}", self.reason));
        if let Some(detail) = &self.detail {
            lines.push(format!("- detail: {detail}"));
        }
        for (key, value) in &self.metadata {
            lines.push(format!("- {key}: {value}"));
        }
        lines.push(String::new());
        lines.join("\n")
    }
}

/// Frontmatter scalars are single-line; YAML folds a line break in a quoted scalar to a space.
fn single_line(value: &str) -> String {
    value
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Task logs for one cadence.
#[derive(Debug, Clone)]
pub struct TaskLogDir {
    dir: PathBuf,
}

impl TaskLogDir {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Write `record` as a new file. Never overwrites an existing log: on a
    /// filename collision the filename timestamp moves forward a second.
    pub fn write(&self, record: &TaskLogRecord, created_at: DateTime<Utc>) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create log dir {}", self.dir.display()))?;
        let contents = record.render(created_at);

        for offset in 0..60 {
            let stamp = (created_at + Duration::seconds(offset)).format(FILENAME_TIMESTAMP_FORMAT);
            let path = self
                .dir
                .join(format!("{stamp}__{}__{}.md", record.agent, record.status));
            match OpenOptions::new().create_new(true).write(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(contents.as_bytes())
                        .with_context(|| format!("write task log {}", path.display()))?;
                    info!(path = %path.display(), status = %record.status, agent = %record.agent, "task log written");
                    return Ok(path);
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(err).with_context(|| format!("create task log {}", path.display()));
                }
            }
        }
        bail!("no free task log filename in {}", self.dir.display())
    }

    /// Strict (completed/failed) logs with their effective timestamps.
    ///
    /// A missing or unreadable directory yields no entries.
    pub fn scan_strict(&self) -> Vec<LogEntry> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) => {
                debug!(dir = %self.dir.display(), err = %err, "log dir not readable, no local history");
                return Vec::new();
            }
        };

        let mut logs = Vec::new();
        for entry in entries.flatten() {
            if !entry.file_type().is_ok_and(|ft| ft.is_file()) {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let Some(parsed) = parse_strict_log_name(&file_name) else {
                continue;
            };
            let contents = fs::read_to_string(entry.path()).unwrap_or_default();
            let created_at =
                frontmatter::read_key(&contents, "created_at").and_then(|raw| parse_created_at(&raw));
            let effective_at = created_at.or(parsed.timestamp);
            if effective_at.is_none() {
                warn!(file = %file_name, "task log has no parseable timestamp, skipping");
            }
            logs.push(LogEntry {
                file_name,
                agent: parsed.agent,
                frontmatter_agent: frontmatter::read_key(&contents, "agent"),
                status: parsed.status,
                effective_at,
            });
        }
        logs.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        logs
    }
}

/// Parsed view of a task log file, for tooling and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTaskLog {
    pub fields: Vec<(String, String)>,
    pub body: String,
}

impl ParsedTaskLog {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Read a task log back into its frontmatter fields and body.
pub fn read_task_log(path: &Path) -> Result<ParsedTaskLog> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read task log {}", path.display()))?;
    let Some((front, body)) = frontmatter::split_frontmatter(&contents) else {
        bail!("task log {} has no frontmatter", path.display());
    };
    Ok(ParsedTaskLog {
        fields: frontmatter::parse_pairs(front),
        body: body.to_string(),
    })
}
