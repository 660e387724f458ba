/*!
 * Retry with jittered exponential backoff.
 */

use std::future::Future;
use std::time::Duration;

use log::debug;
use tokio_util::sync::CancellationToken;

use crate::app_config::FallbackConfig;
use crate::errors::TranslationError;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one
    pub max_retries: u32,
    /// Deadline for a single attempt
    pub request_timeout: Duration,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&FallbackConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &FallbackConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            request_timeout: config.request_timeout(),
            base_backoff: config.retry_backoff_base(),
            max_backoff: config.max_backoff(),
            jitter: config.enable_jitter,
        }
    }

    /// A policy that makes exactly one attempt
    pub fn no_retries(request_timeout: Duration) -> Self {
        Self {
            max_retries: 0,
            request_timeout,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: false,
        }
    }

    /// The same policy with a different per-attempt deadline
    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Backoff after failed attempt `attempt` (0-based), before jitter:
    /// `B·(attempt+1)·2^(attempt-1)`, with the power term dropped for the first
    /// attempt, capped at the max backoff.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let mut delay = self.base_backoff.saturating_mul(attempt.saturating_add(1));
        if attempt > 0 {
            let factor = 2u32.saturating_pow(attempt - 1);
            delay = delay.saturating_mul(factor);
        }
        delay.min(self.max_backoff)
    }

    /// Backoff with jitter applied (factor in `[0.5, 1.0)`)
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt);
        if self.jitter {
            let factor = 0.5 + 0.5 * rand::random::<f64>();
            delay.mul_f64(factor)
        } else {
            delay
        }
    }

    /// Run `operation` up to `max_retries + 1` times.
    ///
    /// Non-retryable errors are returned immediately. Cancellation aborts both
    /// an in-flight attempt and a pending backoff sleep.
    pub async fn execute<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, TranslationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TranslationError>>,
    {
        let mut last_error = TranslationError::Cancelled;
        for attempt in 0..=self.max_retries {
            if cancel.is_cancelled() {
                return Err(TranslationError::Cancelled);
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TranslationError::Cancelled),
                outcome = tokio::time::timeout(self.request_timeout, operation()) => outcome,
            };

            let error = match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if e.is_cancelled() || !e.is_retryable() => return Err(e),
                Ok(Err(e)) => e,
                Err(_) => TranslationError::Timeout(format!(
                    "attempt {} exceeded {:?}",
                    attempt + 1,
                    self.request_timeout
                )),
            };
            debug!("Attempt {} failed: {}", attempt + 1, error);
            last_error = error;

            if attempt == self.max_retries {
                break;
            }
            let delay = self.delay(attempt);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TranslationError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        Err(last_error)
    }
}
