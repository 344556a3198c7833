//! Retry-with-backoff for local writes that hit a missing parent row
//!
//! Only referential-integrity violations are retried; every other store
//! error propagates on the first attempt.

use crate::error::StoreResult;
use crate::RetryConfig;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Exponential backoff parameters
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// No waiting between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry.saturating_sub(1) as i32);
        let millis = self.base_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

/// Run `op`, retrying while it fails with an integrity violation.
///
/// Gives up after `policy.max_attempts` and returns the last error.
pub async fn retry_on_integrity_violation<T, F, Fut>(
    policy: &BackoffPolicy,
    label: &str,
    mut op: F,
) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_integrity_violation() && attempt < policy.max_attempts => {
                let delay = policy.delay(attempt);
                debug!(
                    op = label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Integrity violation, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                if err.is_integrity_violation() {
                    warn!(op = label, attempts = attempt, error = %err, "Write still violates integrity");
                }
                return Err(err);
            }
        }
    }
}
