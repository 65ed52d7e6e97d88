//! Token-bucket rate limiting.
//!
//! One bucket exists per configured cap (global and per-task); a transfer
//! charges every bucket that applies to it, so the effective rate is the
//! minimum of the caps. Refill period is 100 ms: small enough to keep
//! transfers smooth, large enough to keep the accounting cheap.

use std::sync::Mutex;
use std::time::{Duration, Instant};

const REFILL_PERIOD: Duration = Duration::from_millis(100);

/// Bytes-per-second token bucket. `None` rate = unlimited.
pub struct SpeedLimiter {
    rate: u64,
    state: Mutex<BucketState>,
}

struct BucketState {
    available: f64,
    last_refill: Instant,
}

impl SpeedLimiter {
    /// `rate` in bytes/second; 0 means unlimited.
    pub fn new(rate: u64) -> Self {
        Self {
            rate,
            state: Mutex::new(BucketState {
                available: rate as f64 / 10.0,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate == 0
    }

    /// Charge `bytes` against the bucket. Returns how long the caller should
    /// wait before transferring more (zero when within budget).
    pub fn charge(&self, bytes: u64) -> Duration {
        if self.rate == 0 {
            return Duration::ZERO;
        }
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill);
        // Cap the burst at one refill period's worth of tokens.
        let cap = self.rate as f64 * REFILL_PERIOD.as_secs_f64();
        state.available =
            (state.available + elapsed.as_secs_f64() * self.rate as f64).min(cap);
        state.last_refill = now;
        state.available -= bytes as f64;
        if state.available >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.available / self.rate as f64)
        }
    }

    /// Blocking form for worker threads: charge and sleep off the debt.
    pub fn throttle(&self, bytes: u64) {
        let wait = self.charge(bytes);
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_never_waits() {
        let l = SpeedLimiter::new(0);
        assert_eq!(l.charge(u64::MAX), Duration::ZERO);
        assert!(l.is_unlimited());
    }

    #[test]
    fn overdraft_requires_waiting() {
        let l = SpeedLimiter::new(1000);
        // Burst allowance is one period (100 bytes at 1000 B/s).
        let wait = l.charge(1100);
        assert!(wait > Duration::ZERO);
        // The debt corresponds to roughly one second of transfer.
        assert!(wait <= Duration::from_secs(2));
    }

    #[test]
    fn small_charges_within_burst_are_free() {
        let l = SpeedLimiter::new(1_000_000);
        assert_eq!(l.charge(10), Duration::ZERO);
        assert_eq!(l.charge(10), Duration::ZERO);
    }
}
