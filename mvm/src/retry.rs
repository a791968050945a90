//! Supervised retry for long-running loops.
//!
//! Every background loop in this crate is a sequence of steps. A step returns how long to wait before the next one.
//! Transient failures are retried with exponential backoff. A loop only gives up after a run of consecutive failures,
//! or on a failure retrying cannot fix, and then returns the error to whoever owns the task.

use std::{future::Future, time::Duration};

use anyhow::Result;
use backoff::{ExponentialBackoff, backoff::Backoff};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::error::is_permanent;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_consecutive_failures: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl RetryPolicy {
    pub fn new(
        max_consecutive_failures: u32,
        initial_interval: Duration,
        max_interval: Duration,
    ) -> Self {
        RetryPolicy {
            max_consecutive_failures: max_consecutive_failures.max(1),
            initial_interval,
            max_interval: max_interval.max(initial_interval),
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial_interval,
            initial_interval: self.initial_interval,
            randomization_factor: 0.1,
            multiplier: 2.0,
            max_interval: self.max_interval,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

/// Runs `step` repeatedly until `cancel` fires, sleeping for the duration each successful step returns.
///
/// Returns `Ok(())` on cancellation. Returns the step's error once it fails permanently or
/// `policy.max_consecutive_failures` times in a row.
pub async fn supervise<F, Fut>(
    name: impl Into<String>,
    policy: RetryPolicy,
    cancel: CancellationToken,
    mut step: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Duration>>,
{
    let name = name.into();
    let mut backoff = policy.backoff();
    let mut failures = 0;
    loop {
        let result = select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            result = step() => result,
        };

        let delay = match result {
            Ok(delay) => {
                failures = 0;
                backoff.reset();
                delay
            }
            Err(e) if is_permanent(&e) => {
                error!(task = %name, error = %e, "task failed");
                return Err(e);
            }
            Err(e) => {
                failures += 1;
                if failures >= policy.max_consecutive_failures {
                    error!(task = %name, failures, error = %e, "task keeps failing, giving up");
                    return Err(e.context(format!("{name} failed {failures} times in a row")));
                }
                let delay = backoff.next_backoff().unwrap_or(policy.max_interval);
                warn!(task = %name, failures, error = %e, ?delay, "task failed, retrying");
                delay
            }
        };

        select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
