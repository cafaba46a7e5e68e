//! Retry logic with exponential backoff for retryable provider errors.

use crate::context::CancelToken;
use crate::error::ProviderError;
use std::time::Duration;

/// Backoff policy for retryable provider errors
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Wait before the second attempt
    pub base_delay: Duration,
    /// Growth of the wait per attempt
    pub backoff_factor: f64,
    /// Cap on any single wait
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Wait after the failed attempt `attempt` (0-indexed), capped at `max_delay`
    ///
    /// A factor that yields a negative or non-finite wait falls back to the cap.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let secs = self.base_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        if !secs.is_finite() || secs < 0.0 {
            return self.max_delay;
        }
        Duration::try_from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
            .unwrap_or(self.max_delay)
    }

    /// Single attempt, no backoff
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// Notified before each backoff wait
pub trait RetryCallback {
    /// `attempt` is the 1-indexed attempt that just failed
    fn on_retry(&self, attempt: u32, max_attempts: u32, error: &ProviderError, delay: Duration);
}

/// Logs each retry against a resource ID
pub struct LogCallback<'a> {
    pub resource_id: &'a str,
}

impl RetryCallback for LogCallback<'_> {
    fn on_retry(&self, attempt: u32, max_attempts: u32, error: &ProviderError, delay: Duration) {
        log::warn!(
            "{}: attempt {}/{} failed: {}. Retrying in {:.1}s",
            self.resource_id,
            attempt,
            max_attempts,
            error,
            delay.as_secs_f64()
        );
    }
}

/// Run `operation` until it succeeds, fails fatally, or the budget runs out
///
/// Only errors classified [`crate::ErrorClass::Retryable`] are retried; a
/// fatal error is returned immediately. Backoff waits observe `cancel` and
/// return [`ProviderError::Cancelled`] once it fires.
pub fn with_retry<T, F>(
    config: &RetryConfig,
    cancel: &CancelToken,
    callback: Option<&dyn RetryCallback>,
    mut operation: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Result<T, ProviderError>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        let err = match operation() {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !err.is_retryable() || attempt + 1 >= max_attempts {
            return Err(err);
        }

        let delay = config.delay_for_attempt(attempt);
        if let Some(cb) = callback {
            cb.on_retry(attempt + 1, max_attempts, &err, delay);
        }

        if !cancel.sleep(delay) {
            return Err(ProviderError::Cancelled);
        }

        attempt += 1;
    }
}
