//! Bounded retry with backoff.
//!
//! One combinator serves every call site (command execution, connection
//! setup) instead of hand-written loops. It runs on blocking workers, so
//! backoff sleeps are synchronous and wake early on cancellation.

use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::error::DeployError;

const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    None,
    /// `base * 2^(retry-1)`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        match *self {
            Self::None => Duration::ZERO,
            Self::Exponential { base, max } => {
                let shift = retry.saturating_sub(1).min(16);
                base.saturating_mul(1u32 << shift).min(max)
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

/// `max_retries = N` means at most `N + 1` attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(max_retries: u32, backoff: Backoff) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// Exactly one attempt.
    #[must_use]
    pub const fn once() -> Self {
        Self::new(0, Backoff::None)
    }
}

/// Run `op` until it succeeds, fails with an error `should_retry` rejects,
/// or the retry budget is spent. `op` receives the zero-based attempt number.
///
/// Cancellation is observed before every retry and during backoff; it
/// surfaces as `DeployError::Interrupted` converted into `E`.
pub fn retry_with<T, E, P, F>(
    policy: RetryPolicy,
    cancel: &CancelToken,
    mut should_retry: P,
    mut op: F,
) -> Result<T, E>
where
    E: From<DeployError>,
    P: FnMut(&E) -> bool,
    F: FnMut(u32) -> Result<T, E>,
{
    let mut attempt = 0u32;
    loop {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= policy.max_retries || !should_retry(&err) {
                    return Err(err);
                }
                attempt += 1;
                tracing::debug!(attempt, max_retries = policy.max_retries, "retrying");
                sleep_unless_cancelled(policy.backoff.delay(attempt), cancel);
                if cancel.is_cancelled() {
                    return Err(DeployError::Interrupted.into());
                }
            }
        }
    }
}

fn sleep_unless_cancelled(total: Duration, cancel: &CancelToken) {
    let deadline = Instant::now() + total;
    while !cancel.is_cancelled() {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}
