//! Per-cadence run state (`<log_dir>/.scheduler-run-state.json`).
//!
//! Holds the lock deferral record for the current UTC day. Updates are
//! serialized across processes on the same host with a lock file and always
//! decide on a fresh read taken under that lock.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::deferral::DeferralRecord;

pub const RUN_STATE_FILE: &str = ".scheduler-run-state.json";
pub const RUN_STATE_LOCK_FILE: &str = ".scheduler-run-state.lock";

const LOCK_TIMEOUT: Duration = Duration::from_secs(30);
const LOCK_STALE_AFTER: Duration = Duration::from_secs(10 * 60);

/// Persisted run state for one cadence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunState {
    /// UTC date (`YYYY-MM-DD`) this state belongs to.
    pub run_date: String,
    pub lock_deferral: Option<DeferralRecord>,
}

impl RunState {
    pub fn empty(run_date: &str) -> Self {
        Self {
            run_date: run_date.to_string(),
            lock_deferral: None,
        }
    }

    /// Deferral record for `agent`, if one is recorded.
    pub fn deferral_for(&self, agent: &str) -> Option<&DeferralRecord> {
        self.lock_deferral
            .as_ref()
            .filter(|record| record.selected_agent == agent)
    }
}

/// Run-state file plus its lock file.
#[derive(Debug, Clone)]
pub struct RunStateStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl RunStateStore {
    pub fn new(log_dir: &Path) -> Self {
        Self {
            path: log_dir.join(RUN_STATE_FILE),
            lock_path: log_dir.join(RUN_STATE_LOCK_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load today's state. A missing, unreadable or stale-dated file yields an empty state.
    pub fn load(&self, run_date: &str) -> RunState {
        match read_run_state(&self.path) {
            Ok(Some(state)) if state.run_date == run_date => state,
            Ok(Some(state)) => {
                debug!(stored = %state.run_date, today = run_date, "run state date rolled over");
                RunState::empty(run_date)
            }
            Ok(None) => RunState::empty(run_date),
            Err(err) => {
                warn!(path = %self.path.display(), err = %format!("{err:#}"), "ignoring unreadable run state");
                RunState::empty(run_date)
            }
        }
    }

    /// Read-modify-write today's state under the lock file.
    ///
    /// `apply` sees a fresh read and returns a value passed back to the caller.
    pub fn update<T>(&self, run_date: &str, apply: impl FnOnce(&mut RunState) -> T) -> Result<T> {
        let _guard = acquire_lock(&self.lock_path, LOCK_TIMEOUT, LOCK_STALE_AFTER)?;
        let mut state = self.load(run_date);
        let result = apply(&mut state);
        write_run_state(&self.path, &state)?;
        Ok(result)
    }
}

fn read_run_state(path: &Path) -> Result<Option<RunState>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read run state {}", path.display())),
    };
    let state = serde_json::from_str(&contents)
        .with_context(|| format!("parse run state {}", path.display()))?;
    Ok(Some(state))
}

/// Atomically write run state to disk (temp file + rename).
pub fn write_run_state(path: &Path, state: &RunState) -> Result<()> {
    debug!(path = %path.display(), run_date = %state.run_date, deferral = state.lock_deferral.is_some(), "writing run state");
    let mut buf = serde_json::to_string_pretty(state)?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("run state path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp run state {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace run state {}", path.display()))?;
    Ok(())
}

/// Exclusive lock file, removed on drop.
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn acquire_lock(path: &Path, timeout: Duration, stale_after: Duration) -> Result<LockGuard> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create lock directory {}", parent.display()))?;
    }

    let start = SystemTime::now();
    loop {
        match OpenOptions::new().create_new(true).write(true).open(path) {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
                return Ok(LockGuard {
                    path: path.to_path_buf(),
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                if reclaim_stale_lock(path, stale_after) {
                    warn!(path = %path.display(), "reclaimed stale run state lock");
                    continue;
                }
                let elapsed = SystemTime::now().duration_since(start).unwrap_or_default();
                if elapsed >= timeout {
                    bail!("timed out acquiring lock {}", path.display());
                }
                thread::sleep(Duration::from_millis(50));
            }
            Err(err) => return Err(anyhow!("acquire lock {}: {err}", path.display())),
        }
    }
}

fn reclaim_stale_lock(path: &Path, stale_after: Duration) -> bool {
    let Ok(modified) = fs::metadata(path).and_then(|meta| meta.modified()) else {
        return false;
    };
    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or_default();
    age >= stale_after && fs::remove_file(path).is_ok()
}
