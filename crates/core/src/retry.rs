//! Fixed-delay retry and polling helpers.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::StepError;

/// Attempt budget with a fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }
}

/// Run `op` until it succeeds or the budget runs out.
///
/// `op` receives the 1-based attempt number.
pub async fn retry<T, F, Fut>(step: &'static str, policy: RetryPolicy, mut op: F) -> Result<T, StepError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        if attempt > 1 && !policy.delay.is_zero() {
            tokio::time::sleep(policy.delay).await;
        }

        match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    info!(step, attempt, "Succeeded on retry");
                }
                return Ok(value);
            }
            Err(e) => {
                warn!(step, attempt, max = attempts, error = %format!("{:#}", e), "Attempt failed");
                last_error = Some(e);
            }
        }
    }

    Err(StepError::Exhausted {
        step,
        attempts,
        last: last_error.map(|e| format!("{:#}", e)).unwrap_or_default(),
    })
}

/// Poll `read` up to `polls` times until `done` accepts the value.
///
/// Read errors count as a failed poll. Returns the last value read (or
/// None if every read failed) together with whether `done` was satisfied.
pub async fn poll_until<T, F, Fut>(
    label: &str,
    polls: u32,
    interval: Duration,
    mut read: F,
    done: impl Fn(&T) -> bool,
) -> (Option<T>, bool)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
    T: std::fmt::Debug,
{
    let mut last = None;
    for poll in 1..=polls.max(1) {
        match read().await {
            Ok(value) => {
                if done(&value) {
                    return (Some(value), true);
                }
                debug!(label, poll, value = ?value, "Waiting");
                last = Some(value);
            }
            Err(e) => debug!(label, poll, error = %e, "Poll failed"),
        }
        if poll < polls && !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }
    }
    (last, false)
}
