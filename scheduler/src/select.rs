//! Rotation state for `scheduler select` and `scheduler run`.

use std::collections::BTreeSet;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use crate::core::events::remote_exclusions;
use crate::core::exclusion::{merge, previous_agent, recently_run};
use crate::core::selector::{is_saturated, select_next};
use crate::io::backend::{LockBackend, structured_payload};
use crate::io::config::SchedulerConfig;
use crate::io::process::CommandOutput;
use crate::io::roster::load_cadence_roster;
use crate::io::task_log::TaskLogDir;

/// Everything selection needs, resolved once per cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rotation {
    pub roster: Vec<String>,
    /// Agents claimed remotely (locked, paused or completed).
    pub remote: BTreeSet<String>,
    /// Agents with a strict task log inside the cadence window.
    pub recent: BTreeSet<String>,
    /// Agent of the most recent strict task log, when still on the roster.
    pub previous: Option<String>,
    pub first_prompt: Option<String>,
}

impl Rotation {
    pub fn excluded(&self) -> BTreeSet<String> {
        merge(&self.remote, &self.recent)
    }

    /// Every roster agent ran within the window.
    pub fn is_saturated(&self) -> bool {
        is_saturated(&self.roster, &self.recent)
    }

    /// Next agent to attempt, skipping `excluded`.
    pub fn next(&self, excluded: &BTreeSet<String>) -> Option<&str> {
        select_next(
            &self.roster,
            excluded,
            self.previous.as_deref(),
            self.first_prompt.as_deref(),
        )
    }
}

/// Load the roster, query remote claims and scan local task logs.
#[instrument(skip_all, fields(cadence = %config.cadence))]
pub fn resolve_rotation<B: LockBackend>(
    config: &SchedulerConfig,
    backend: &B,
    now: DateTime<Utc>,
) -> Result<Rotation> {
    let cadence = config.cadence;
    let roster = load_cadence_roster(&config.roster_path, cadence)?;

    let check = backend.check(cadence).unwrap_or_else(|err| {
        warn!(err = %format!("{err:#}"), "lock check could not run");
        CommandOutput::launch_failure(&err)
    });
    if !check.success() {
        warn!(exit_code = check.code, "lock check failed, treating remote claims as empty");
    }
    let remote = remote_exclusions(structured_payload(&check).as_ref());

    let entries = TaskLogDir::new(&config.log_dir).scan_strict();
    let recent = recently_run(&entries, now, cadence.window());
    if !recent.is_empty() {
        let agents: Vec<&str> = recent.iter().map(String::as_str).collect();
        info!(
            agents = %agents.join(", "),
            window = cadence.window_label(),
            "excluding agents that ran within the window"
        );
    }
    let previous = previous_agent(&entries, &roster);

    Ok(Rotation {
        roster,
        remote,
        recent,
        previous,
        first_prompt: config.first_prompt.clone(),
    })
}

/// Structured selection outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectOutcome {
    /// Every roster agent ran within the window.
    Saturated,
    /// Every roster agent is excluded.
    Exhausted,
    /// Agent that would be attempted next.
    Selected(String),
}

/// Dry-run selection: no lock is taken and nothing is written.
pub fn select_agent<B: LockBackend>(
    config: &SchedulerConfig,
    backend: &B,
    now: DateTime<Utc>,
) -> Result<SelectOutcome> {
    let rotation = resolve_rotation(config, backend, now)?;
    if rotation.is_saturated() {
        return Ok(SelectOutcome::Saturated);
    }
    Ok(match rotation.next(&rotation.excluded()) {
        Some(agent) => SelectOutcome::Selected(agent.to_string()),
        None => SelectOutcome::Exhausted,
    })
}
