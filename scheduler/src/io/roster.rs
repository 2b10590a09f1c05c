//! Roster file loading (`{"daily": [...], "weekly": [...]}`).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::debug;

use crate::core::types::Cadence;

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Roster {
    pub daily: Vec<String>,
    pub weekly: Vec<String>,
}

impl Roster {
    /// Ordered, de-duplicated agents for `cadence`; blank entries are dropped.
    pub fn agents(&self, cadence: Cadence) -> Vec<String> {
        let raw = match cadence {
            Cadence::Daily => &self.daily,
            Cadence::Weekly => &self.weekly,
        };
        let mut agents: Vec<String> = Vec::with_capacity(raw.len());
        for agent in raw.iter().map(|a| a.trim()).filter(|a| !a.is_empty()) {
            if !agents.iter().any(|existing| existing == agent) {
                agents.push(agent.to_string());
            }
        }
        agents
    }
}

pub fn load_roster(path: &Path) -> Result<Roster> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read roster {}", path.display()))?;
    let roster: Roster = serde_json::from_str(&contents)
        .with_context(|| format!("parse roster {}", path.display()))?;
    debug!(daily = roster.daily.len(), weekly = roster.weekly.len(), "roster loaded");
    Ok(roster)
}

/// Load the roster for `cadence`, failing when it has no agents or an agent id
/// contains `_` (the task log filename separator).
pub fn load_cadence_roster(path: &Path, cadence: Cadence) -> Result<Vec<String>> {
    let agents = load_roster(path)?.agents(cadence);
    if agents.is_empty() {
        bail!("No roster entries for cadence {cadence} in {}", path.display());
    }
    if let Some(agent) = agents.iter().find(|agent| agent.contains('_')) {
        bail!(
            "Roster agent {agent:?} for cadence {cadence} in {} contains '_', which task log names reserve as a separator",
            path.display()
        );
    }
    Ok(agents)
}
