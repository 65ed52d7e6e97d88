use crate::error::EngineError;
use crate::options::DownloadOptions;
use std::time::Duration;

/// Decision returned by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Do not retry this error.
    NoRetry,
    /// Retry after the given delay.
    RetryAfter(Duration),
}

/// Exponential backoff with caps. One budget applies per URI; when it is
/// exhausted the group advances to its next URI.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum retry attempts after the initial try.
    pub max_retries: u32,
    /// Base delay, doubled after each attempt.
    pub base_delay: Duration,
    /// Upper bound on backoff delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn from_options(options: &DownloadOptions) -> Self {
        Self {
            max_retries: options.max_retries,
            base_delay: Duration::from_secs(options.retry_delay_seconds.max(1)),
            ..Self::default()
        }
    }

    /// Backoff delay for a given attempt without consulting an error:
    /// `base × 2^attempt`, capped. `attempt` is 0-based (0 = first retry).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = 1u32 << attempt.min(16);
        self.base_delay.saturating_mul(exp).min(self.max_delay)
    }

    /// Decide whether to retry after `error`, on the given 1-based attempt.
    pub fn decide(&self, attempt: u32, error: &EngineError) -> RetryDecision {
        if attempt > self.max_retries || !error.is_retryable() {
            return RetryDecision::NoRetry;
        }
        RetryDecision::RetryAfter(self.backoff(attempt.saturating_sub(1)))
    }
}
