//! Bounded retry with exponential backoff for panel fetches

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

use crate::config::NodeConfig;
use crate::error::{ControllerError, Result};
use crate::logger::log;

/// Cap on a single backoff sleep
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// How often a failed fetch is retried within one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, at least 1
    pub attempts: u32,
    /// First backoff, doubled after each failure
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            attempts: config.retry_attempts.max(1),
            backoff: config.retry_backoff,
        }
    }

    /// Single attempt, no backoff
    pub fn once() -> Self {
        Self {
            attempts: 1,
            backoff: Duration::ZERO,
        }
    }

    /// Sleep before attempt `attempt + 1` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.backoff.saturating_mul(factor).min(MAX_BACKOFF)
    }

    /// Run `op` until it succeeds, fails permanently or attempts run out.
    ///
    /// Backoff sleeps end early with `Cancelled` once `shutdown` flips to true.
    pub async fn run<T, F, Fut>(
        &self,
        what: &str,
        shutdown: &mut watch::Receiver<bool>,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 0;
        loop {
            if *shutdown.borrow() {
                return Err(ControllerError::Cancelled);
            }
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            attempt += 1;
            if attempt >= attempts || !err.is_transient() {
                return Err(err);
            }

            let delay = self.delay(attempt - 1);
            log::debug!(
                what = what,
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying after failure"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    // A dropped sender also means nobody is waiting for us
                    if changed.is_err() || *shutdown.borrow() {
                        return Err(ControllerError::Cancelled);
                    }
                }
            }
        }
    }
}
