//! Delay schedules between retry attempts

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackoffStrategy {
    Fixed,
    /// `initial * base^(n-1)` after the n-th failure
    Exponential { base: f64 },
}

/// Delay to wait after each failed attempt, bounded by `max_delay`
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    strategy: BackoffStrategy,
    initial_delay: Duration,
    max_delay: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            initial_delay: delay,
            max_delay: delay,
            jitter: false,
        }
    }

    /// Doubling from `initial_delay` up to `max_delay`, with jitter
    pub fn exponential(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential { base: 2.0 },
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            jitter: true,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn strategy(&self) -> BackoffStrategy {
        self.strategy
    }

    /// Delay after the `failures`-th consecutive failure (1-indexed)
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let base = match self.strategy {
            BackoffStrategy::Fixed => self.initial_delay,
            BackoffStrategy::Exponential { base } => {
                let nanos = self.initial_delay.as_nanos() as f64 * base.powi(failures as i32 - 1);
                if nanos.is_finite() && nanos < self.max_delay.as_nanos() as f64 {
                    Duration::from_nanos(nanos as u64)
                } else {
                    self.max_delay
                }
            }
        };
        let capped = base.min(self.max_delay);
        if self.jitter {
            spread(capped)
        } else {
            capped
        }
    }
}

/// ±20% so replacements for several slots do not start in lockstep
fn spread(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..1.2);
    Duration::from_nanos((delay.as_nanos() as f64 * factor) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_ignores_failure_count() {
        let backoff = Backoff::fixed(Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(9), Duration::from_millis(100));
        assert_eq!(backoff.delay(0), Duration::ZERO);
    }

    #[test]
    fn test_exponential_is_capped() {
        let backoff = Backoff::exponential(Duration::from_millis(100), Duration::from_millis(500))
            .with_jitter(false);
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(4), Duration::from_millis(500));
        assert_eq!(backoff.delay(5000), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let backoff = Backoff::fixed(Duration::from_millis(100)).with_jitter(true);
        for _ in 0..50 {
            let delay = backoff.delay(1);
            assert!(delay >= Duration::from_millis(80));
            assert!(delay <= Duration::from_millis(120));
        }
    }
}
