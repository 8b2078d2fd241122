//! Exponential backoff for transient RPC failures

use crate::config::RetryConfig;
use crate::error::{LoadError, LoadResult};

use backoff::future::retry_notify;
use backoff::ExponentialBackoff;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::warn;

/// Retry policy for gateway calls. Only `LoadError::Network` is retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, multiplier: f64, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            multiplier,
            max_delay,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.base_delay,
            initial_interval: self.base_delay,
            multiplier: self.multiplier,
            max_interval: self.max_delay,
            randomization_factor: 0.2,
            // Attempts are bounded by count, not elapsed time
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, method: &str, mut op: F) -> LoadResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = LoadResult<T>>,
    {
        let attempts = AtomicU32::new(0);
        let max_attempts = self.max_attempts;

        retry_notify(
            self.backoff(),
            || {
                let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
                let fut = op(attempt);
                async move {
                    match fut.await {
                        Ok(value) => Ok(value),
                        Err(e) if e.is_retryable() && attempt < max_attempts => {
                            Err(backoff::Error::transient(e))
                        }
                        Err(e) => Err(backoff::Error::permanent(e)),
                    }
                }
            },
            |err: LoadError, delay: Duration| {
                warn!(
                    method,
                    attempt = attempts.load(Ordering::Relaxed),
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Transient RPC failure, backing off: {}",
                    err
                );
                crate::metrics::record_rpc_retry(method);
            },
        )
        .await
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            config.multiplier,
            Duration::from_millis(config.max_delay_ms),
            config.max_attempts,
        )
    }
}
