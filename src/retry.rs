use futures::FutureExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use crate::{DagtickError, TerminalFailure, panic_message};

/// How often a task is attempted and how long to wait between attempts.
///
/// The wait after failed attempt `i` is `base_delay * 2^(i-1)` plus a uniform
/// random offset in `[0, jitter)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            jitter: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), DagtickError> {
        if self.max_attempts == 0 {
            return Err(DagtickError::InvalidPolicy(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.base_delay.is_zero() {
            return Err(DagtickError::InvalidPolicy(
                "base_delay must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Deterministic part of the wait after failed attempt `attempt` (1-indexed).
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }

    /// Full wait after failed attempt `attempt`, jitter included.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff(attempt).saturating_add(self.sample_jitter())
    }

    fn sample_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return Duration::ZERO;
        }
        let secs = rand::thread_rng().gen_range(0.0..self.jitter.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Result<Self, DagtickError> {
        policy.validate()?;
        Ok(Self { policy })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `operation` until it succeeds or the policy's attempts are used up.
    ///
    /// `operation` receives the 1-indexed attempt number. A panic inside an
    /// attempt counts as a failed attempt. Cancelling `ctx` interrupts the
    /// backoff wait and returns [`DagtickError::Cancelled`].
    pub async fn execute_with_retry<F, Fut, T>(
        &self,
        ctx: &CancellationToken,
        task_name: &str,
        mut operation: F,
    ) -> Result<T, DagtickError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let max_attempts = self.policy.max_attempts;
        let mut attempt = 0;

        loop {
            attempt += 1;

            if ctx.is_cancelled() {
                return Err(DagtickError::Cancelled(format!(
                    "task '{task_name}' cancelled before attempt {attempt}"
                )));
            }

            debug!(task = task_name, attempt, max_attempts, "attempting task");

            let error = match AssertUnwindSafe(operation(attempt)).catch_unwind().await {
                Ok(Ok(output)) => return Ok(output),
                Ok(Err(e)) => e,
                Err(payload) => anyhow::anyhow!("task panicked: {}", panic_message(&*payload)),
            };

            if attempt >= max_attempts {
                warn!(
                    task = task_name,
                    attempt,
                    error = %format!("{error:#}"),
                    "final attempt failed"
                );
                return Err(TerminalFailure {
                    task_name: task_name.to_string(),
                    attempts: attempt,
                    last_error: error,
                }
                .into());
            }

            let delay = self.policy.backoff(attempt);
            warn!(
                task = task_name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %format!("{error:#}"),
                "attempt failed, retrying"
            );

            tokio::select! {
                _ = ctx.cancelled() => {
                    return Err(DagtickError::Cancelled(format!(
                        "task '{task_name}' cancelled during retry wait"
                    )));
                }
                _ = sleep(delay) => {}
            }
        }
    }
}
