//! Bounded retries with exponential backoff and jitter for transient cluster failures.

use std::{future::Future, time::Duration};

use rand::Rng;
use tracing::warn;

use crate::cluster::ClientError;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RetryConfig {
    /// Total number of attempts, including the first one. `0` is treated as `1`.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2,
        }
    }
}

impl RetryConfig {
    /// A config which gives up after the first failure.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Runs `operation` until it succeeds, fails with a non-transient error, or the attempts of
/// `config` are used up.
///
/// Only errors for which [`ClientError::is_transient`] holds are retried. The last error is
/// returned unchanged, so a transient error coming out of here means the retries are exhausted.
pub async fn retry_transient<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, ClientError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    let mut delay = config.initial_delay.min(config.max_delay);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(result) => return Ok(result),
            Err(error) if !error.is_transient() || attempt >= config.attempts() => {
                return Err(error);
            }
            Err(error) => {
                // 0.5x to 1.5x of the nominal delay
                let jitter = rand::rng().random_range(0.5..1.5);
                let jittered = delay.mul_f64(jitter);
                warn!(
                    operation = operation_name,
                    attempt,
                    error = %error,
                    delay_ms = jittered.as_millis(),
                    "transient failure, retrying"
                );
                tokio::time::sleep(jittered).await;
                delay = delay
                    .saturating_mul(config.backoff_multiplier)
                    .min(config.max_delay);
            }
        }
    }
}
