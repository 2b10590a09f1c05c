//! Deferral state machine for lock backend failures.
//!
//! When lock acquisition exhausts its retries on a backend error, non-strict
//! deployments may postpone the failure to a later invocation instead of
//! failing the cadence. Deferrals are bounded by a count and a time window, and
//! every deferred attempt for the same agent and day reuses one idempotency key
//! so the backend can deduplicate partially applied claims.
//!
//! This module only decides; `io::run_state` persists the outcome.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::core::exclusion::parse_created_at;
use crate::core::types::{Cadence, iso_timestamp};

/// Persisted deferral record (`lock_deferral` in run state).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferralRecord {
    pub selected_agent: String,
    pub attempt_count: u32,
    /// First failure of the day for this agent (RFC 3339).
    pub first_failure_timestamp: String,
    pub backend_category: String,
    pub idempotency_key: String,
}

/// Deferral knobs taken from `SchedulerConfig`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeferralPolicy {
    pub strict_lock: bool,
    pub retry_window: Duration,
    pub max_deferrals: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferralKind {
    /// Strict mode: fail immediately, run state untouched.
    Strict,
    /// Soft outcome: exit 0, status `deferred`.
    Defer,
    /// Budget or window exhausted: hard failure, record kept for the rest of the day.
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferralDecision {
    pub kind: DeferralKind,
    /// Record describing this failure. Persisted unless `kind` is `Strict`.
    pub record: DeferralRecord,
}

impl DeferralDecision {
    pub fn persists(&self) -> bool {
        self.kind != DeferralKind::Strict
    }

    pub fn is_deferred(&self) -> bool {
        self.kind == DeferralKind::Defer
    }
}

/// Idempotency key shared by every deferred attempt for one agent and day.
pub fn idempotency_key(cadence: Cadence, agent: &str, run_date: &str, token: &str) -> String {
    format!("{cadence}:{agent}:{run_date}:{token}")
}

/// Decide what an exhausted lock retry loop means for this cycle.
///
/// `existing` is the record loaded for today; a record for another agent is
/// ignored (and will be replaced). `new_key` is only called when no key can be
/// reused.
pub fn decide_backend_failure(
    existing: Option<&DeferralRecord>,
    agent: &str,
    backend_category: &str,
    policy: DeferralPolicy,
    now: DateTime<Utc>,
    new_key: impl FnOnce() -> String,
) -> DeferralDecision {
    let prior = existing.filter(|record| record.selected_agent == agent);

    let attempt_count = prior.map_or(0, |record| record.attempt_count) + 1;
    let first_failure = prior
        .and_then(|record| parse_created_at(&record.first_failure_timestamp))
        .unwrap_or(now);
    let idempotency_key = match prior {
        Some(record) if !record.idempotency_key.is_empty() => record.idempotency_key.clone(),
        _ => new_key(),
    };

    let record = DeferralRecord {
        selected_agent: agent.to_string(),
        attempt_count,
        first_failure_timestamp: iso_timestamp(first_failure),
        backend_category: backend_category.to_string(),
        idempotency_key,
    };

    let kind = if policy.strict_lock {
        DeferralKind::Strict
    } else if attempt_count <= policy.max_deferrals && now - first_failure <= policy.retry_window {
        DeferralKind::Defer
    } else {
        DeferralKind::Exhausted
    };

    DeferralDecision { kind, record }
}
