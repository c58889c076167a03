use std::time::Duration;

use rand::Rng;

pub const DEFAULT_BACKOFF_INITIAL_DELAY_MILLIS: u64 = 1_000;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;
pub const DEFAULT_BACKOFF_MAX_DELAY_MILLIS: u64 = 60_000;

/// Jitter proportion applied to every delay; the resulting delay lies in
/// `[base * (1 - RANDOM_FACTOR), base * (1 + RANDOM_FACTOR)]`.
const RANDOM_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, Copy)]
pub struct BackoffParams {
    pub initial_delay_millis: u64,
    pub backoff_factor: f64,
    pub max_delay_millis: u64,
}

impl Default for BackoffParams {
    fn default() -> Self {
        Self {
            initial_delay_millis: DEFAULT_BACKOFF_INITIAL_DELAY_MILLIS,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_delay_millis: DEFAULT_BACKOFF_MAX_DELAY_MILLIS,
        }
    }
}

/// Exponential backoff schedule for stream reconnects.
///
/// `next_delay` returns the jittered delay to wait before the next attempt
/// and advances the schedule. `reset` returns to the initial delay after a
/// healthy connection; `reset_to_max` jumps straight to the cap, used when
/// the backend reports resource exhaustion.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    params: BackoffParams,
    current_base_millis: u64,
}

impl ExponentialBackoff {
    pub fn new(params: BackoffParams) -> Self {
        Self {
            params,
            current_base_millis: 0,
        }
    }

    pub fn reset(&mut self) {
        self.current_base_millis = 0;
    }

    pub fn reset_to_max(&mut self) {
        self.current_base_millis = self.params.max_delay_millis;
    }

    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with_rng(&mut rand::thread_rng())
    }

    fn next_delay_with_rng<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let base = self.current_base_millis as f64;
        let jitter = RANDOM_FACTOR * base * rng.gen_range(-1.0..=1.0);
        let delay = (base + jitter)
            .round()
            .clamp(0.0, self.params.max_delay_millis as f64) as u64;

        self.current_base_millis = ((self.current_base_millis as f64
            * self.params.backoff_factor) as u64)
            .clamp(
                self.params.initial_delay_millis,
                self.params.max_delay_millis,
            );

        Duration::from_millis(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn first_attempt_is_immediate() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut backoff = ExponentialBackoff::new(BackoffParams::default());
        assert_eq!(backoff.next_delay_with_rng(&mut rng), Duration::ZERO);
    }

    #[test]
    fn delays_grow_toward_cap() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut backoff = ExponentialBackoff::new(BackoffParams::default());
        let mut last = backoff.next_delay_with_rng(&mut rng);
        for _ in 0..32 {
            let next = backoff.next_delay_with_rng(&mut rng);
            assert!(next.as_millis() <= (DEFAULT_BACKOFF_MAX_DELAY_MILLIS as u128 * 3) / 2);
            last = next;
        }
        // After enough attempts the base saturates at the cap; jitter keeps
        // the observed delay within +/-50% of it.
        assert!(last.as_millis() >= (DEFAULT_BACKOFF_MAX_DELAY_MILLIS as u128) / 2);
    }

    #[test]
    fn reset_to_max_skips_the_ramp() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut backoff = ExponentialBackoff::new(BackoffParams::default());
        backoff.reset_to_max();
        let delay = backoff.next_delay_with_rng(&mut rng);
        assert!(delay.as_millis() >= (DEFAULT_BACKOFF_MAX_DELAY_MILLIS as u128) / 2);
    }

    #[test]
    fn reset_returns_to_immediate_retry() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut backoff = ExponentialBackoff::new(BackoffParams::default());
        let _ = backoff.next_delay_with_rng(&mut rng);
        let _ = backoff.next_delay_with_rng(&mut rng);
        backoff.reset();
        assert_eq!(backoff.next_delay_with_rng(&mut rng), Duration::ZERO);
    }
}
