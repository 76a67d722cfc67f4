//! Bounded exponential backoff with full jitter for storage calls.

use crate::config::RetryConfig;
use crate::utils::errors::Result;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Delay before retry number `attempt` (1-based): uniform in `[0, min(max, initial * 2^(attempt-1))]`.
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let ceiling = Duration::from_millis(config.initial_interval_ms)
        .saturating_mul(1u32 << exponent)
        .min(Duration::from_millis(config.max_interval_ms));

    let millis = ceiling.as_millis() as u64;
    if millis == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
}

/// Run `op` until it succeeds, fails with a permanent error, or `max_attempts` is reached.
pub async fn retry<T, F, Fut>(config: &RetryConfig, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = backoff_delay(config, attempt);
                debug!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
