use std::time::Duration;

use rand::Rng;

/// Jittered exponential backoff sequence generator used for reconnect
/// delays. Doubling from `initial` to `max`, resampled fresh on every
/// disconnect, with +/-50% jitter by default. Exposed so a policy can
/// override `reconnect_backoff()` and flatten thundering-herd reconnects.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            jitter: 0.5,
            attempt: 0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Resets the sequence, e.g. after a successful reconnect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Returns the next delay and advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let base_ms = (self.initial.as_millis() as f64) * 2f64.powi(self.attempt as i32);
        let capped_ms = base_ms.min(self.max.as_millis() as f64);
        self.attempt = self.attempt.saturating_add(1);

        let jitter_span = capped_ms * self.jitter;
        let jittered_ms = if jitter_span > 0.0 {
            let delta = rand::thread_rng().gen_range(-jitter_span..=jitter_span);
            (capped_ms + delta).max(0.0)
        } else {
            capped_ms
        };

        Duration::from_millis(jittered_ms as u64)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_never_exceed_max_plus_jitter() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(1000));
        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_millis(1500));
        }
    }

    #[test]
    fn reset_restarts_from_initial() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(1000))
            .with_jitter(0.0);
        for _ in 0..5 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn doubles_without_jitter() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(60))
            .with_jitter(0.0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
    }
}
