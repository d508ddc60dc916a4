//! Bounded retries for eventually-consistent operations.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::cloud::ProvisionError;
use crate::logger::StepLogger;
use crate::remote::SshError;

/// Fixed-attempt, fixed-delay retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    /// Cloud control plane propagation (key creation, IAM bindings).
    pub const CLOUD: RetryPolicy = RetryPolicy::new(5, Duration::from_secs(5));
    /// sshd restarts after configuration changes.
    pub const SSHD_RESTART: RetryPolicy = RetryPolicy::new(10, Duration::from_secs(10));

    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Run `op` until it succeeds or the budget is spent.
    ///
    /// Permanent errors (bad credentials, changed host keys) are returned
    /// immediately. Each attempt after the first is reported through
    /// [`StepLogger::log_retry`].
    pub async fn run<T, F, Fut>(&self, logger: &dyn StepLogger, mut op: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if is_permanent(&err) => return Err(err),
                Err(err) if attempt >= max_attempts => {
                    return Err(err.context(format!("giving up after {max_attempts} attempts")));
                }
                Err(err) => {
                    debug!(attempt, max_attempts, error = %format!("{err:#}"), "attempt failed");
                    attempt += 1;
                    logger.log_retry();
                    tokio::time::sleep(self.delay).await;
                }
            }
        }
    }
}

/// Whether any cause in the chain is an error retrying cannot fix.
pub fn is_permanent(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<ProvisionError>()
            .is_some_and(ProvisionError::is_permanent)
            || cause
                .downcast_ref::<SshError>()
                .is_some_and(SshError::is_permanent)
    })
}
