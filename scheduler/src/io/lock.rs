//! Lock acquisition with bounded exponential backoff.

use std::thread;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tracing::{debug, info, instrument};

use crate::core::classifier::{BackendCategory, classify_backend_error};
use crate::core::types::Cadence;
use crate::io::backend::{LOCK_ACQUIRED, LOCK_ALREADY_CLAIMED, LOCK_BACKEND_ERROR, LockBackend};
use crate::io::config::LockRetryPolicy;
use crate::io::process::CommandOutput;

/// Blocking delay between lock attempts.
pub trait Sleeper {
    fn sleep(&self, delay: Duration);
}

/// Sleeps the current thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, delay: Duration) {
        thread::sleep(delay);
    }
}

/// Parameters for one acquisition call.
#[derive(Debug, Clone)]
pub struct LockRequest<'a> {
    pub agent: &'a str,
    pub cadence: Cadence,
    /// UTC date (`YYYY-MM-DD`) used for the fallback correlation id.
    pub run_date: &'a str,
    /// Key carried over from an earlier deferral of this agent today.
    pub idempotency_key: Option<&'a str>,
}

impl LockRequest<'_> {
    pub fn correlation_id(&self) -> String {
        match self.idempotency_key {
            Some(key) => key.to_string(),
            None => format!("{}:{}:{}", self.cadence, self.agent, self.run_date),
        }
    }
}

/// How the final lock attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockExit {
    Acquired,
    /// Exit 3: another party holds this claim. Not a backend error.
    AlreadyClaimed,
    /// Exit 2 after the retry budget was spent.
    BackendError(BackendCategory),
    /// Any other non-zero exit. Never retried.
    Failed(i32),
}

/// Transient record of an acquisition call.
#[derive(Debug, Clone)]
pub struct LockAttempt {
    pub exit: LockExit,
    /// Output of the last attempt.
    pub output: CommandOutput,
    pub attempts: u32,
    /// Delays actually slept between attempts.
    pub backoff_schedule_ms: Vec<u64>,
    pub correlation_id: String,
}

impl LockAttempt {
    pub fn backoff_schedule(&self) -> String {
        self.backoff_schedule_ms
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Backoff before retry number `attempt` (1-based): `backoff * 2^(attempt-1) + jitter`.
pub fn backoff_delay_ms(policy: LockRetryPolicy, attempt: u32, rng: &mut impl Rng) -> u64 {
    let exponent = attempt.saturating_sub(1).min(32);
    let base = policy.backoff_ms.saturating_mul(1u64 << exponent);
    let jitter = if policy.jitter_ms > 0 {
        rng.gen_range(0..=policy.jitter_ms)
    } else {
        0
    };
    base.saturating_add(jitter)
}

/// Try to claim `request.agent`, retrying backend errors (exit 2) with backoff.
///
/// At most `max_retries + 1` attempts are made, strictly one at a time.
#[instrument(skip_all, fields(agent = %request.agent, cadence = %request.cadence))]
pub fn acquire_with_retry<B: LockBackend, S: Sleeper, G: Rng>(
    backend: &B,
    request: &LockRequest<'_>,
    policy: LockRetryPolicy,
    sleeper: &S,
    rng: &mut G,
) -> Result<LockAttempt> {
    let correlation_id = request.correlation_id();
    let mut backoff_schedule_ms = Vec::new();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let mut attempt_env = Vec::with_capacity(3);
        if let Some(key) = request.idempotency_key {
            attempt_env.push(("SCHEDULER_LOCK_IDEMPOTENCY_KEY".to_string(), key.to_string()));
        }
        attempt_env.push((
            "SCHEDULER_LOCK_CORRELATION_ID".to_string(),
            correlation_id.clone(),
        ));
        attempt_env.push(("SCHEDULER_LOCK_ATTEMPT_ID".to_string(), attempts.to_string()));

        let output = backend.lock(request.agent, request.cadence, &attempt_env)?;
        debug!(attempt = attempts, exit_code = output.code, "lock attempt finished");

        let exit = match output.code {
            LOCK_ACQUIRED => LockExit::Acquired,
            LOCK_ALREADY_CLAIMED => LockExit::AlreadyClaimed,
            LOCK_BACKEND_ERROR if attempts > policy.max_retries => {
                LockExit::BackendError(classify_backend_error(&output.diagnostics()))
            }
            LOCK_BACKEND_ERROR => {
                let delay_ms = backoff_delay_ms(policy, attempts, rng);
                backoff_schedule_ms.push(delay_ms);
                info!(
                    event = "scheduler.lock.retry",
                    attempt = attempts,
                    max_retries = policy.max_retries,
                    delay_ms,
                    correlation_id = %correlation_id,
                    selected_agent = %request.agent,
                    cadence = %request.cadence,
                    "lock backend error, retrying"
                );
                if delay_ms > 0 {
                    sleeper.sleep(Duration::from_millis(delay_ms));
                }
                continue;
            }
            code => LockExit::Failed(code),
        };

        return Ok(LockAttempt {
            exit,
            output,
            attempts,
            backoff_schedule_ms,
            correlation_id,
        });
    }
}
