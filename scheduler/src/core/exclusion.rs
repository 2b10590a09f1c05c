//! Exclusion set resolution over task-log history.
//!
//! Pure functions only: the directory scan lives in `io::task_log` and hands
//! us already-parsed [`LogEntry`] values.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use regex::Regex;

use crate::core::types::LogStatus;

/// Filename timestamp layout (`:` replaced by `-` so it is filesystem-safe).
pub const FILENAME_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%SZ";

static STRICT_LOG_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{4}-\d{2}-\d{2}T\d{2}-\d{2}-\d{2}Z)__([^_]+)__(completed|failed)\.md$").unwrap()
});

/// A strict (completed/failed) task log as seen by the exclusion resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub file_name: String,
    /// Agent encoded in the filename.
    pub agent: String,
    /// Agent recorded in frontmatter, when present.
    pub frontmatter_agent: Option<String>,
    pub status: LogStatus,
    /// Frontmatter `created_at` when parseable, else the filename timestamp.
    pub effective_at: Option<DateTime<Utc>>,
}

impl LogEntry {
    /// Frontmatter agent is authoritative; the filename is a fallback.
    pub fn recorded_agent(&self) -> &str {
        self.frontmatter_agent.as_deref().unwrap_or(&self.agent)
    }
}

/// Parsed components of a strict log filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrictLogName {
    pub timestamp: Option<DateTime<Utc>>,
    pub agent: String,
    pub status: LogStatus,
}

/// Parse `<ts>__<agent>__<completed|failed>.md`. Deferred and foreign files yield `None`.
pub fn parse_strict_log_name(file_name: &str) -> Option<StrictLogName> {
    let caps = STRICT_LOG_NAME_RE.captures(file_name)?;
    let status = match &caps[3] {
        "completed" => LogStatus::Completed,
        _ => LogStatus::Failed,
    };
    Some(StrictLogName {
        timestamp: parse_filename_timestamp(&caps[1]),
        agent: caps[2].to_string(),
        status,
    })
}

/// Parse the filename timestamp component.
pub fn parse_filename_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, FILENAME_TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Parse an RFC 3339 timestamp as found in `created_at`.
pub fn parse_created_at(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Agents with a strict log whose effective timestamp is within `window` of `now`.
pub fn recently_run(entries: &[LogEntry], now: DateTime<Utc>, window: Duration) -> BTreeSet<String> {
    let cutoff = now - window;
    entries
        .iter()
        .filter(|entry| entry.effective_at.is_some_and(|at| at >= cutoff))
        .map(|entry| entry.agent.clone())
        .collect()
}

/// Agent of the most recent strict log, if it is a roster member.
///
/// Entries without a usable timestamp are skipped. On equal timestamps the
/// lexicographically greatest filename wins.
pub fn previous_agent(entries: &[LogEntry], roster: &[String]) -> Option<String> {
    let mut ordered: Vec<&LogEntry> = entries.iter().collect();
    ordered.sort_by(|a, b| b.file_name.cmp(&a.file_name));

    let mut latest: Option<(&LogEntry, DateTime<Utc>)> = None;
    for entry in ordered {
        let Some(at) = entry.effective_at else {
            continue;
        };
        if latest.is_none_or(|(_, best)| at > best) {
            latest = Some((entry, at));
        }
    }

    let agent = latest?.0.recorded_agent();
    roster
        .iter()
        .any(|member| member == agent)
        .then(|| agent.to_string())
}

/// Union of remote and local exclusions.
pub fn merge(remote: &BTreeSet<String>, local: &BTreeSet<String>) -> BTreeSet<String> {
    remote.union(local).cloned().collect()
}
