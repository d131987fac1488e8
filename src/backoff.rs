//! Bounded exponential backoff for chain calls.

use crate::atom::AtomResult;
use std::future::Future;
use std::time::Duration;

/// Retry policy for unreliable chain RPCs.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Backoff ceiling.
    pub max_delay: Duration,
    /// Attempts per call before giving up until the next tick.
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 3,
        }
    }
}

/// Run `op` with exponential backoff, stopping early on a non-retryable
/// error. The overall deadline is the caller's: one tick step owns at
/// most `max_attempts` attempts.
pub async fn retry<T, F, Fut>(config: &RetryConfig, mut op: F) -> AtomResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AtomResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < config.max_attempts => {
                let exp = 2u32.saturating_pow(attempt - 1);
                let delay = config.base_delay.saturating_mul(exp).min(config.max_delay);
                log::debug!(
                    "chain call failed on attempt {}: {}; retrying in {:?}",
                    attempt,
                    err,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
