use rand::{rng, Rng};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::warn;

use crate::errors::{Result, WorkerError};

/// Bounded retries with linear backoff and jitter
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    base_backoff_ms: u64,
    max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, 200, 5_000)
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_backoff_ms: if base_backoff_ms == 0 {
                200
            } else {
                base_backoff_ms
            },
            max_backoff_ms: max_backoff_ms.max(base_backoff_ms),
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn calculate_backoff(&self, attempt: usize) -> Duration {
        let linear = self.base_backoff_ms.saturating_mul(attempt as u64 + 1);
        let backoff = linear.min(self.max_backoff_ms);
        let jitter = rng().random_range(backoff / 2..=backoff); // 50-100% jitter
        Duration::from_millis(jitter)
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or
    /// the attempts are exhausted. Backoff sleeps end early on shutdown.
    pub async fn run<T, E, F, Fut>(
        &self,
        operation: &str,
        shutdown: &mut watch::Receiver<bool>,
        mut op: F,
    ) -> Result<T>
    where
        E: Into<WorkerError>,
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            let error: WorkerError = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e.into(),
            };
            attempt += 1;
            if !error.is_retryable() || attempt >= self.max_attempts {
                return Err(error);
            }

            let backoff = self.calculate_backoff(attempt - 1);
            warn!(
                operation = operation,
                attempt = attempt,
                max_attempts = self.max_attempts,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "retrying after transient failure"
            );
            if !sleep_or_shutdown(backoff, shutdown).await {
                return Err(WorkerError::ShuttingDown);
            }
        }
    }
}

/// Sleeps for `duration` unless shutdown is signalled first.
///
/// Returns `false` when interrupted by shutdown.
pub async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    let deadline = Instant::now() + duration;
    tokio::select! {
        _ = tokio::time::sleep_until(deadline) => true,
        signalled = async { shutdown.wait_for(|stop| *stop).await.is_ok() } => {
            if signalled {
                return false;
            }
            // sender gone, shutdown can no longer be signalled
            tokio::time::sleep_until(deadline).await;
            true
        }
    }
}
