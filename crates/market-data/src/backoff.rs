use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;

/// Exponential backoff with jitter for market-data requests.
///
/// Attempt `n` (1-based, counting the failed attempt) waits
/// `base * 2^(n-1)` scaled by a random factor in `jitter`, capped at the
/// cap for its error class. Rate-limit failures use their own, slower base
/// and cap.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub rate_limit_base_delay: Duration,
    pub rate_limit_max_delay: Duration,
    pub jitter: (f64, f64),
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(16),
            rate_limit_base_delay: Duration::from_secs(5),
            rate_limit_max_delay: Duration::from_secs(60),
            jitter: (0.5, 1.5),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    fn base_and_cap(&self, rate_limited: bool) -> (Duration, Duration) {
        if rate_limited {
            (self.rate_limit_base_delay, self.rate_limit_max_delay)
        } else {
            (self.base_delay, self.max_delay)
        }
    }

    /// Un-jittered delay after failed attempt `attempt`, capped.
    pub fn nominal_delay(&self, attempt: u32, rate_limited: bool) -> Duration {
        let (base, cap) = self.base_and_cap(rate_limited);
        let exponent = attempt.saturating_sub(1).min(16);
        base.saturating_mul(1u32 << exponent).min(cap)
    }

    /// Inclusive range a jittered delay for `attempt` falls into.
    pub fn jitter_band(&self, attempt: u32, rate_limited: bool) -> (Duration, Duration) {
        let (_, cap) = self.base_and_cap(rate_limited);
        let nominal = self.nominal_delay(attempt, rate_limited).as_secs_f64();
        let low = Duration::from_secs_f64(nominal * self.jitter.0).min(cap);
        let high = Duration::from_secs_f64(nominal * self.jitter.1).min(cap);
        (low, high)
    }

    /// Jittered delay after failed attempt `attempt`.
    pub fn delay_for<R: Rng>(&self, attempt: u32, rate_limited: bool, rng: &mut R) -> Duration {
        let (_, cap) = self.base_and_cap(rate_limited);
        let (low, high) = self.jitter;
        let factor = if high > low { rng.gen_range(low..=high) } else { low };
        let nominal = self.nominal_delay(attempt, rate_limited).as_secs_f64();
        Duration::from_secs_f64(nominal * factor).min(cap)
    }
}

/// Waits between attempts. Injected so tests can observe the schedule
/// without sleeping.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nominal_delay_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.nominal_delay(1, false), Duration::from_secs(2));
        assert_eq!(policy.nominal_delay(2, false), Duration::from_secs(4));
        assert_eq!(policy.nominal_delay(3, false), Duration::from_secs(8));
        assert_eq!(policy.nominal_delay(4, false), Duration::from_secs(16));
        assert_eq!(policy.nominal_delay(9, false), Duration::from_secs(16));
    }

    #[test]
    fn rate_limits_back_off_slower() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.nominal_delay(1, true), Duration::from_secs(5));
        assert_eq!(policy.nominal_delay(3, true), Duration::from_secs(20));
        assert_eq!(policy.nominal_delay(5, true), Duration::from_secs(60));
    }

    #[test]
    fn jittered_delay_stays_in_band() {
        let policy = RetryPolicy::default();
        let mut rng = rand::thread_rng();
        for attempt in 1..=6 {
            for rate_limited in [false, true] {
                let (low, high) = policy.jitter_band(attempt, rate_limited);
                for _ in 0..50 {
                    let delay = policy.delay_for(attempt, rate_limited, &mut rng);
                    assert!(delay >= low && delay <= high, "{:?} not in {:?}..={:?}", delay, low, high);
                }
            }
        }
    }

    #[test]
    fn max_retries_is_at_least_one() {
        assert_eq!(RetryPolicy::default().with_max_retries(0).max_retries, 1);
    }
}
