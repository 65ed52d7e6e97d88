//! Retry loop: run a closure until success or the policy says stop.

use super::policy::{RetryDecision, RetryPolicy};
use crate::error::EngineError;

/// Runs a closure until it succeeds or the retry policy says to stop.
/// On retryable failure, sleeps for the backoff duration then tries again.
/// Only for blocking contexts (segment workers); the scheduler thread uses
/// retry commands with deadlines instead.
pub fn run_with_retry<F>(policy: &RetryPolicy, mut f: F) -> Result<(), EngineError>
where
    F: FnMut() -> Result<(), EngineError>,
{
    let mut attempt = 1u32;
    loop {
        match f() {
            Ok(()) => return Ok(()),
            Err(e) => match policy.decide(attempt, &e) {
                RetryDecision::NoRetry => return Err(e),
                RetryDecision::RetryAfter(d) => {
                    tracing::debug!(attempt, delay_ms = d.as_millis() as u64, error = %e, "retrying");
                    std::thread::sleep(d);
                    attempt += 1;
                }
            },
        }
    }
}
