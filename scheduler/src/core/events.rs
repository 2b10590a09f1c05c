//! JSON payloads and events emitted by lock backend commands.
//!
//! Backends may write newline-delimited JSON objects to the structured event
//! channel. Older backends interleave a JSON line with human output on
//! stdout/stderr instead; both shapes are parsed here.

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;
use serde_json::{Map, Value};

/// A single JSON object event.
pub type Event = Map<String, Value>;

/// Return the last line of `text` that parses as a JSON object or array.
pub fn parse_json_from_output(text: &str) -> Option<Value> {
    text.lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{') || line.starts_with('['))
        .rev()
        .find_map(|line| serde_json::from_str(line).ok())
}

/// Collect every line of `text` that parses as a JSON object, in order.
pub fn parse_json_events(text: &str) -> Vec<Event> {
    text.lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .filter_map(|line| match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        })
        .collect()
}

/// Agents excluded by a check payload.
///
/// `excluded` wins when it is an array; otherwise the union of `locked`,
/// `paused` and `completed`. Missing or malformed payloads exclude nobody.
pub fn remote_exclusions(payload: Option<&Value>) -> BTreeSet<String> {
    let Some(Value::Object(map)) = payload else {
        return BTreeSet::new();
    };
    if let Some(Value::Array(excluded)) = map.get("excluded") {
        return string_items(excluded).collect();
    }
    ["locked", "paused", "completed"]
        .iter()
        .filter_map(|key| match map.get(*key) {
            Some(Value::Array(items)) => Some(items),
            _ => None,
        })
        .flat_map(|items| string_items(items))
        .collect()
}

fn string_items(items: &[Value]) -> impl Iterator<Item = String> + '_ {
    items
        .iter()
        .filter_map(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Relay health report returned by the health command.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    #[serde(default)]
    pub ok: Option<bool>,
    #[serde(default)]
    pub relays: Vec<String>,
    #[serde(default)]
    pub failure_category: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl HealthReport {
    pub fn from_payload(payload: Option<&Value>) -> Self {
        payload
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or_default()
    }

    /// A report only signals failure when it explicitly says `ok: false`.
    pub fn reports_failure(&self) -> bool {
        self.ok == Some(false)
    }
}

/// Distribution of per-relay publish failure reasons from a failed lock attempt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LockFailureSummary {
    pub reason_distribution: BTreeMap<String, Value>,
    pub attempt_id: Option<String>,
    pub correlation_id: Option<String>,
    pub total_elapsed_ms: Option<u64>,
}

impl LockFailureSummary {
    pub fn distribution_json(&self) -> String {
        serde_json::to_string(&self.reason_distribution).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Summarise lock failure events.
///
/// The last `lock_publish_quorum_failed` event carries an authoritative
/// distribution. Without one, `lock_publish_failure` events are counted by reason.
pub fn summarize_lock_failure_reasons(events: &[Event]) -> LockFailureSummary {
    let quorum = events.iter().rev().find(|event| {
        event.get("event").and_then(Value::as_str) == Some("lock_publish_quorum_failed")
    });
    if let Some(event) = quorum
        && let Some(Value::Object(distribution)) = event.get("reasonDistribution")
    {
        return LockFailureSummary {
            reason_distribution: distribution
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            attempt_id: scalar_string(event.get("attemptId")),
            correlation_id: scalar_string(event.get("correlationId")),
            total_elapsed_ms: event.get("totalElapsedMs").and_then(Value::as_u64),
        };
    }

    let mut counts: BTreeMap<String, u64> = BTreeMap::new();
    for event in events {
        if event.get("event").and_then(Value::as_str) != Some("lock_publish_failure") {
            continue;
        }
        let reason = event
            .get("reason")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or("unknown");
        *counts.entry(reason.to_string()).or_default() += 1;
    }
    LockFailureSummary {
        reason_distribution: counts
            .into_iter()
            .map(|(k, v)| (k, Value::from(v)))
            .collect(),
        ..LockFailureSummary::default()
    }
}

fn scalar_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
