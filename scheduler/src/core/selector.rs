//! Deterministic round-robin selection over the roster.

use std::collections::BTreeSet;

/// Pick the next agent to attempt.
///
/// Starts after `previous` when it is a roster member, else at `first_override`
/// when configured and present, else at index 0. Scans the whole roster
/// circularly and returns the first agent not in `excluded`.
///
/// Returns `None` when every roster agent is excluded.
pub fn select_next<'a>(
    roster: &'a [String],
    excluded: &BTreeSet<String>,
    previous: Option<&str>,
    first_override: Option<&str>,
) -> Option<&'a str> {
    if roster.is_empty() {
        return None;
    }
    let position = |name: &str| roster.iter().position(|agent| agent == name);

    let start = match previous.and_then(position) {
        Some(index) => (index + 1) % roster.len(),
        None => first_override.and_then(position).unwrap_or(0),
    };

    (0..roster.len())
        .map(|offset| roster[(start + offset) % roster.len()].as_str())
        .find(|candidate| !excluded.contains(*candidate))
}

/// True when every roster agent is in `recent`: the rotation is complete for the window.
pub fn is_saturated(roster: &[String], recent: &BTreeSet<String>) -> bool {
    !roster.is_empty() && roster.iter().all(|agent| recent.contains(agent))
}
