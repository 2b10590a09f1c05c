//! Shared deterministic types for scheduler core logic.
//!
//! These types define stable contracts between core components. They carry no
//! I/O and serialize to the exact tokens written into task logs and run state.

use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Scheduling frequency class. Each cadence has its own roster, window and log directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cadence {
    Daily,
    Weekly,
}

impl Cadence {
    pub fn as_str(self) -> &'static str {
        match self {
            Cadence::Daily => "daily",
            Cadence::Weekly => "weekly",
        }
    }

    /// Recency window used by the local exclusion guard.
    pub fn window(self) -> Duration {
        match self {
            Cadence::Daily => Duration::hours(24),
            Cadence::Weekly => Duration::days(7),
        }
    }

    /// Human label for the recency window (`24-hour`, `7-day`).
    pub fn window_label(self) -> &'static str {
        match self {
            Cadence::Daily => "24-hour",
            Cadence::Weekly => "7-day",
        }
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Cadence {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(Cadence::Daily),
            "weekly" => Ok(Cadence::Weekly),
            other => Err(anyhow!("unknown cadence '{other}' (expected daily|weekly)")),
        }
    }
}

/// Terminal status recorded in a task log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Completed,
    Failed,
    /// Lock backend failure postponed to a later invocation. Not terminal for rotation.
    Deferred,
}

impl LogStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LogStatus::Completed => "completed",
            LogStatus::Failed => "failed",
            LogStatus::Deferred => "deferred",
        }
    }

    /// Completed and failed logs count for rotation and recency; deferred logs never do.
    pub fn is_strict(self) -> bool {
        matches!(self, LogStatus::Completed | LogStatus::Failed)
    }
}

impl fmt::Display for LogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "completed" => Ok(LogStatus::Completed),
            "failed" => Ok(LogStatus::Failed),
            "deferred" => Ok(LogStatus::Deferred),
            other => Err(anyhow!("unknown log status '{other}'")),
        }
    }
}

/// Top-level failure taxonomy written as `failure_category`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    PromptParse,
    PromptSchema,
    Execution,
    LockBackend,
    MemoryPolicy,
    ArtifactVerification,
    RosterExhausted,
}

impl FailureCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureCategory::PromptParse => "prompt_parse_error",
            FailureCategory::PromptSchema => "prompt_schema_error",
            FailureCategory::Execution => "execution_error",
            FailureCategory::LockBackend => "lock_backend_error",
            FailureCategory::MemoryPolicy => "memory_policy_violation",
            FailureCategory::ArtifactVerification => "artifact_verification_error",
            FailureCategory::RosterExhausted => "roster_exhausted",
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ISO 8601 UTC timestamp with millisecond precision (`2026-02-15T08:30:00.000Z`).
pub fn iso_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// UTC calendar date key used by run state (`YYYY-MM-DD`).
pub fn run_date(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d").to_string()
}

/// Failure class attached next to `lock_backend_error` when the backend is unreachable.
pub const BACKEND_UNAVAILABLE: &str = "backend_unavailable";
