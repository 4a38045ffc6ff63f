//! Rate limiting for repeated failure logs.
//!
//! A renewal loop that cannot reach the store fails on every tick; logging
//! each one floods the output. [`FailureThrottle`] lets the first failure
//! through, then at most one per interval, and reports recovery once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

fn u64_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

pub struct FailureThrottle {
    start: Instant,
    /// Next time a failure may be logged, in milliseconds since `start`.
    next_log_ms: AtomicU64,
    interval_ms: u64,
    consecutive: AtomicU64,
}

impl FailureThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            start: Instant::now(),
            next_log_ms: AtomicU64::new(0),
            interval_ms: u64_millis(interval),
            consecutive: AtomicU64::new(0),
        }
    }

    /// Count a failure. Returns the consecutive failure count when it should be logged.
    pub fn record_failure(&self) -> Option<u64> {
        let count = self.consecutive.fetch_add(1, Ordering::Relaxed) + 1;
        let now_ms = u64_millis(self.start.elapsed());
        let next = self.next_log_ms.load(Ordering::Relaxed);
        if count > 1 && now_ms < next {
            return None;
        }

        let new_next = now_ms.saturating_add(self.interval_ms);
        self.next_log_ms
            .compare_exchange(next, new_next, Ordering::Relaxed, Ordering::Relaxed)
            .ok()
            .map(|_| count)
    }

    /// Clear the failure streak. Returns its length if there was one.
    pub fn record_success(&self) -> Option<u64> {
        match self.consecutive.swap(0, Ordering::Relaxed) {
            0 => None,
            n => {
                self.next_log_ms.store(0, Ordering::Relaxed);
                Some(n)
            }
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn first_failure_is_logged_and_repeats_are_throttled() {
        let throttle = FailureThrottle::new(Duration::from_secs(30));
        assert_eq!(throttle.record_failure(), Some(1));
        assert_eq!(throttle.record_failure(), None);
        assert_eq!(throttle.record_failure(), None);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(throttle.record_failure(), Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn success_reports_streak_once() {
        let throttle = FailureThrottle::new(Duration::from_secs(30));
        assert_eq!(throttle.record_success(), None);
        throttle.record_failure();
        throttle.record_failure();
        assert_eq!(throttle.record_success(), Some(2));
        assert_eq!(throttle.record_success(), None);
        assert_eq!(throttle.record_failure(), Some(1));
    }
}
