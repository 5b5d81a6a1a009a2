//! Exponential backoff with jitter
//!
//! Delays double from `base_ms` up to `max_ms`, with ±20% random jitter so
//! concurrent deployments do not hammer a recovering Docker daemon in lockstep.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use super::constants::{DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BASE_MS, DEFAULT_RETRY_MAX_MS, RETRY_JITTER_PERCENT};
use crate::models::errors::AppResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_ms: u64,
    pub max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_ms: DEFAULT_RETRY_BASE_MS,
            max_ms: DEFAULT_RETRY_MAX_MS,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_ms: u64, max_ms: u64) -> Self {
        Self { max_retries, base_ms, max_ms }
    }

    /// Un-jittered delay before retry number `attempt` (1-based)
    pub fn base_delay_ms(&self, attempt: u32) -> u64 {
        let exp = attempt.saturating_sub(1).min(32);
        self.base_ms.saturating_mul(1_u64 << exp).min(self.max_ms)
    }

    /// Delay before retry number `attempt`, with jitter applied
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let capped = self.base_delay_ms(attempt);
        let jitter_range = (capped * RETRY_JITTER_PERCENT / 100) as i64;
        let jitter: i64 = if jitter_range > 0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0
        };
        Duration::from_millis((capped as i64 + jitter).max(0) as u64)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or
    /// the retry budget is spent. Returns the result and the attempt count.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> (AppResult<T>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return (Ok(value), attempt),
                Err(e) if e.is_retryable() && attempt <= self.max_retries => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        op = label,
                        error = %e,
                        "⏳ Retry {}/{} after {}ms",
                        attempt,
                        self.max_retries,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    debug!(op = label, attempts = attempt, "Giving up: {}", e);
                    return (Err(e), attempt);
                }
            }
        }
    }
}

/// Next reconnect delay: double the current one, capped
pub fn next_backoff_ms(current_ms: u64, max_ms: u64) -> u64 {
    current_ms.saturating_mul(2).min(max_ms)
}
