//! Backoff for sync rounds that lost a conditional write.
//!
//! Only `VersionConflict` is retried: another writer moved the remote
//! version between our fetch and our put, so a fresh round can succeed.
//! Transport failures go straight back to the caller.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use lockbox_common::{Error, Result};

/// Bounded exponential backoff around a fetch/compare/push round.
#[derive(Debug, Clone)]
pub struct ConflictRetry {
    max_retries: u32,
    initial_delay: Duration,
    jitter: bool,
}

impl ConflictRetry {
    pub fn new(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            jitter: true,
        }
    }

    /// Delay before retry number `attempt` (zero-based): doubles each time,
    /// scaled by a random factor in [0.75, 1.25) when jitter is on.
    fn delay(&self, attempt: u32) -> Duration {
        let doubled = self.initial_delay.saturating_mul(1u32 << attempt.min(16));
        if self.jitter {
            doubled.mul_f64(0.75 + rand::random::<f64>() * 0.5)
        } else {
            doubled
        }
    }

    /// Run `round` until it returns anything but a version conflict.
    ///
    /// # Errors
    /// - `Sync` once `max_retries` extra rounds have all lost the race
    /// - Any other error from `round`, unchanged and without retrying
    pub async fn run<F, Fut, T>(&self, round: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match round().await {
                Err(err) if err.is_retryable() => {
                    if attempt == self.max_retries {
                        warn!(rounds = attempt + 1, %err, "Giving up on conflicting writes");
                        return Err(Error::Sync(format!(
                            "gave up after {} retries: {}",
                            self.max_retries, err
                        )));
                    }
                    let delay = self.delay(attempt);
                    attempt += 1;
                    warn!(attempt, ?delay, %err, "Lost conditional write; retrying");
                    sleep(delay).await;
                }
                other => {
                    if attempt > 0 && other.is_ok() {
                        debug!(retries = attempt, "Sync round succeeded after retrying");
                    }
                    return other;
                }
            }
        }
    }
}
