// tunnelkeep - Backoff Policy
// Retry delay computation for reconnect attempts

use std::time::Duration;

use tunnelkeep_common::RestartConfig;

/// Source of jitter scaling factors in `[0, 1)`. Injected so delay
/// computation is deterministic under test.
pub type JitterSource = Box<dyn FnMut() -> f64 + Send>;

/// Bounded exponential backoff with symmetric jitter.
///
/// `next_delay(attempt)` is a pure function of the attempt number:
/// `base = min(max, min * factor^attempt)`, scaled by a random factor in
/// `[1 - jitter, 1 + jitter]` and clamped to >= 0.
pub struct Backoff {
    min: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
    rng: JitterSource,
}

impl Backoff {
    pub fn new(cfg: &RestartConfig) -> Self {
        Self::with_jitter_source(cfg, Box::new(|| rand::Rng::gen::<f64>(&mut rand::thread_rng())))
    }

    pub fn with_jitter_source(cfg: &RestartConfig, rng: JitterSource) -> Self {
        Self {
            min: Duration::from_millis(cfg.min_delay_ms),
            max: Duration::from_millis(cfg.max_delay_ms),
            factor: cfg.factor,
            jitter: cfg.jitter.clamp(0.0, 1.0),
            rng,
        }
    }

    /// Base delay before jitter for the given attempt number.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if self.min.is_zero() {
            return Duration::ZERO;
        }
        let grown = self.min.as_millis() as f64 * self.factor.powi(attempt as i32);
        let capped = grown.min(self.max.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Jittered delay for the given attempt number.
    pub fn next_delay(&mut self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter == 0.0 {
            return base;
        }
        // (rng() * 2 - 1) maps [0, 1) onto [-1, 1)
        let delta = self.jitter * ((self.rng)() * 2.0 - 1.0);
        let scaled = base.as_millis() as f64 * (1.0 + delta);
        if scaled <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_millis(scaled as u64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RestartConfig {
        RestartConfig {
            min_delay_ms: 2000,
            max_delay_ms: 30000,
            factor: 2.0,
            jitter: 0.2,
            debounce_ms: 2000,
        }
    }

    fn fixed(value: f64) -> JitterSource {
        Box::new(move || value)
    }

    #[test]
    fn test_base_delay_doubles_until_cap() {
        let backoff = Backoff::with_jitter_source(&policy(), fixed(0.5));
        assert_eq!(backoff.base_delay(0), Duration::from_millis(2000));
        assert_eq!(backoff.base_delay(1), Duration::from_millis(4000));
        assert_eq!(backoff.base_delay(2), Duration::from_millis(8000));
        assert_eq!(backoff.base_delay(3), Duration::from_millis(16000));
        assert_eq!(backoff.base_delay(4), Duration::from_millis(30000));
        assert_eq!(backoff.base_delay(10), Duration::from_millis(30000));
    }

    #[test]
    fn test_jitter_bounds() {
        // rng 0.0 -> lower bound, rng ~1.0 -> upper bound
        let mut low = Backoff::with_jitter_source(&policy(), fixed(0.0));
        assert_eq!(low.next_delay(0), Duration::from_millis(1600));

        let mut high = Backoff::with_jitter_source(&policy(), fixed(1.0));
        assert_eq!(high.next_delay(0), Duration::from_millis(2400));

        let mut mid = Backoff::with_jitter_source(&policy(), fixed(0.5));
        assert_eq!(mid.next_delay(1), Duration::from_millis(4000));
    }

    #[test]
    fn test_delays_stay_within_jitter_band() {
        for attempt in 0..8 {
            let backoff = Backoff::with_jitter_source(&policy(), fixed(0.5));
            let base = backoff.base_delay(attempt).as_millis() as f64;
            for step in 0..10 {
                let roll = step as f64 / 10.0;
                let mut b = Backoff::with_jitter_source(&policy(), fixed(roll));
                let delay = b.next_delay(attempt).as_millis() as f64;
                assert!(delay >= base * 0.8 - 1.0, "attempt {attempt}, roll {roll}");
                assert!(delay <= base * 1.2 + 1.0, "attempt {attempt}, roll {roll}");
            }
        }
    }

    #[test]
    fn test_zero_jitter_is_exact() {
        let mut cfg = policy();
        cfg.jitter = 0.0;
        let mut backoff = Backoff::with_jitter_source(&cfg, fixed(0.99));
        assert_eq!(backoff.next_delay(2), Duration::from_millis(8000));
    }

    #[test]
    fn test_zero_min_delay_means_no_wait() {
        let mut cfg = policy();
        cfg.min_delay_ms = 0;
        let mut backoff = Backoff::with_jitter_source(&cfg, fixed(0.5));
        assert_eq!(backoff.next_delay(5), Duration::ZERO);
    }
}
