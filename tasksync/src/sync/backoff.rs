use rand::Rng;
use std::time::Duration;

/// Delay schedule for a poller that keeps failing: exponential from `base`,
/// capped at `max`, optionally with full jitter. A success resets it.
#[derive(Debug, Clone)]
pub struct PollBackoff {
    base: Duration,
    max: Duration,
    jitter: bool,
    failures: u32,
}

impl PollBackoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self {
            base,
            max,
            jitter,
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn on_failure(&mut self) -> Duration {
        let mut rng = rand::thread_rng();
        self.on_failure_with_rng(&mut rng)
    }

    pub fn on_failure_with_rng<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let delay = self.delay_for(self.failures, rng);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    /// Ceiling after `failures` misses, or a uniform draw below it when
    /// jittered.
    fn delay_for<R: Rng + ?Sized>(&self, failures: u32, rng: &mut R) -> Duration {
        let ceiling = self
            .base
            .checked_mul(1 << failures.min(16))
            .map_or(self.max, |delay| delay.min(self.max));
        if self.jitter {
            rng.gen_range(Duration::ZERO..=ceiling)
        } else {
            ceiling
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn consecutive_failures_grow_exponentially_up_to_cap() {
        let mut backoff = PollBackoff::new(
            Duration::from_millis(100),
            Duration::from_millis(800),
            false,
        );
        let mut rng = StdRng::seed_from_u64(1);
        let delays: Vec<u64> = (0..5)
            .map(|_| backoff.on_failure_with_rng(&mut rng).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 800]);
        assert_eq!(backoff.failures(), 5);
    }

    #[test]
    fn reset_starts_over_from_base() {
        let mut backoff = PollBackoff::new(
            Duration::from_millis(100),
            Duration::from_millis(800),
            false,
        );
        let mut rng = StdRng::seed_from_u64(7);
        backoff.on_failure_with_rng(&mut rng);
        backoff.on_failure_with_rng(&mut rng);
        backoff.reset();
        assert_eq!(
            backoff.on_failure_with_rng(&mut rng),
            Duration::from_millis(100)
        );
    }

    #[test]
    fn jittered_delay_is_capped() {
        let mut backoff =
            PollBackoff::new(Duration::from_millis(100), Duration::from_millis(800), true);
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..8 {
            assert!(backoff.on_failure_with_rng(&mut rng) <= Duration::from_millis(800));
        }
    }

    #[test]
    fn huge_base_saturates_at_cap() {
        let mut backoff = PollBackoff::new(Duration::MAX / 2, Duration::from_secs(60), false);
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..20 {
            assert_eq!(
                backoff.on_failure_with_rng(&mut rng),
                Duration::from_secs(60)
            );
        }
    }

    #[test]
    fn jitter_stays_under_the_current_ceiling() {
        let mut backoff =
            PollBackoff::new(Duration::from_millis(100), Duration::from_millis(800), true);
        let mut rng = StdRng::seed_from_u64(9);
        assert!(backoff.on_failure_with_rng(&mut rng) <= Duration::from_millis(100));
        assert!(backoff.on_failure_with_rng(&mut rng) <= Duration::from_millis(200));
    }
}
