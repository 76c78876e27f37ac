use std::{
    fmt::Display,
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::time::Instant;

pub const DEFAULT_MIN_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Default)]
struct Armed {
    since: Option<Instant>,
    triggered: bool,
}

/// Throttles a loop that keeps failing against the store.
///
/// Every failure waits an escalating delay before returning. Once failures have persisted for
/// `trigger_after` the breaker logs a single error. The first success closes it again.
pub struct CircuitBreaker {
    name: String,
    trigger_after: Duration,
    min_delay: Duration,
    max_delay: Duration,
    failures: AtomicU32,
    armed: Mutex<Armed>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, trigger_after: Duration) -> Self {
        Self {
            name: name.into(),
            trigger_after,
            min_delay: DEFAULT_MIN_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            failures: AtomicU32::new(0),
            armed: Mutex::new(Armed::default()),
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        self.consecutive_failures() > 0
    }

    pub fn is_triggered(&self) -> bool {
        self.armed.lock().triggered
    }

    pub fn success(&self) {
        if self.failures.swap(0, Ordering::AcqRel) == 0 {
            return;
        }

        *self.armed.lock() = Armed::default();
        tracing::info!(breaker = %self.name, "Circuit breaker disarmed");
    }

    /// Delay to wait after the `failures`-th consecutive failure.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.min_delay
            .saturating_mul(1 << exponent)
            .min(self.max_delay)
    }

    /// Records a failure and waits out the current backoff delay.
    pub async fn failure(&self, error: &(dyn Display + Sync)) {
        let failures = self.failures.fetch_add(1, Ordering::AcqRel).saturating_add(1);
        let delay = self.delay_for(failures);

        let newly_triggered = {
            let mut armed = self.armed.lock();
            let since = *armed.since.get_or_insert_with(Instant::now);

            if failures == 1 {
                tracing::warn!(breaker = %self.name, "Circuit breaker armed: {error}");
            }

            let trigger = !armed.triggered && since.elapsed() >= self.trigger_after;
            armed.triggered |= trigger;
            trigger
        };

        if newly_triggered {
            tracing::error!(
                breaker = %self.name,
                failures,
                "Circuit breaker triggered, failures have persisted for {:?}: {error}",
                self.trigger_after
            );
        } else {
            tracing::warn!(
                breaker = %self.name,
                failures,
                delay_ms = delay.as_millis() as u64,
                "Operation failed, backing off: {error}"
            );
        }

        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_up_to_the_maximum() {
        let breaker = CircuitBreaker::new("test", Duration::from_secs(120));

        assert_eq!(breaker.delay_for(1), Duration::from_secs(1));
        assert_eq!(breaker.delay_for(2), Duration::from_secs(2));
        assert_eq!(breaker.delay_for(5), Duration::from_secs(16));
        assert_eq!(breaker.delay_for(6), Duration::from_secs(30));
        assert_eq!(breaker.delay_for(500), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn triggers_once_failures_persist() {
        let breaker = CircuitBreaker::new("test", Duration::from_secs(10));

        for _ in 0..4 {
            breaker.failure(&"boom").await;
        }
        // the fourth failure happened 7s after the first
        assert!(!breaker.is_triggered());

        breaker.failure(&"boom").await;
        assert!(breaker.is_triggered());
        assert_eq!(breaker.consecutive_failures(), 5);

        breaker.success();
        assert!(!breaker.is_open());
        assert!(!breaker.is_triggered());
    }
}
