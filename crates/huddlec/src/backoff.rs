use rand::Rng;
use std::time::Duration;

/// Exponential backoff with randomized jitter, shared by relay reconnects and
/// link renegotiation.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    current: Duration,
    attempts: u32,
}

impl ExponentialBackoff {
    /// Creates a backoff starting at `initial`, growing by `factor` per attempt and
    /// capped at `max`.
    ///
    /// # Examples
    ///
    /// ```
    /// use huddlec::backoff::ExponentialBackoff;
    /// use std::time::Duration;
    /// let mut backoff = ExponentialBackoff::new(
    ///     Duration::from_millis(500),
    ///     Duration::from_millis(8000),
    ///     2.0,
    /// );
    /// let delay = backoff.next_delay();
    /// assert!(delay >= Duration::from_millis(375));
    /// assert!(delay <= Duration::from_millis(625));
    /// assert_eq!(backoff.attempts(), 1);
    /// ```
    #[must_use]
    pub const fn new(initial: Duration, max: Duration, factor: f64) -> Self {
        Self {
            initial,
            max,
            factor,
            current: initial,
            attempts: 0,
        }
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    /// Compute the next delay (with ±25% jitter) and advance the internal state.
    pub fn next_delay(&mut self) -> Duration {
        let current_ms = self.current.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;

        let jitter_factor = rand::thread_rng().gen_range(0.75..=1.25);
        let delay = Duration::from_millis((current_ms as f64 * jitter_factor) as u64);

        let next_ms = (current_ms as f64 * self.factor) as u64;
        self.current = Duration::from_millis(next_ms.min(max_ms));
        self.attempts = self.attempts.saturating_add(1);

        delay
    }

    /// Number of delays handed out since creation or the last reset.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Reset the backoff to its initial delay.
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doubling(initial_ms: u64, max_ms: u64) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(initial_ms),
            Duration::from_millis(max_ms),
            2.0,
        )
    }

    #[test]
    fn first_delay_is_jittered_initial() {
        let mut backoff = doubling(100, 5000);
        let delay = backoff.next_delay();
        assert!(delay >= Duration::from_millis(75));
        assert!(delay <= Duration::from_millis(125));
    }

    #[test]
    #[allow(clippy::cast_precision_loss)]
    fn delays_never_exceed_max_with_jitter() {
        let max = Duration::from_millis(1000);
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(100), max, 2.0);

        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(
                delay.as_millis() as f64 <= max.as_millis() as f64 * 1.25 + 1.0,
                "delay {delay:?} exceeds cap"
            );
        }
    }

    #[test]
    fn delays_grow_until_cap() {
        let mut backoff = doubling(100, 100_000);
        let first = backoff.next_delay();
        for _ in 0..4 {
            backoff.next_delay();
        }
        // Fifth delay is around 1600ms, well clear of the first even with jitter.
        assert!(backoff.next_delay() > first * 4);
    }

    #[test]
    fn reset_restores_initial_range_and_attempts() {
        let mut backoff = doubling(100, 5000);
        for _ in 0..10 {
            backoff.next_delay();
        }
        assert_eq!(backoff.attempts(), 10);

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        let delay = backoff.next_delay();
        assert!(delay >= Duration::from_millis(75) && delay <= Duration::from_millis(125));
    }

    #[test]
    fn overflow_safe_with_huge_max() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(u64::MAX), 2.0);
        for _ in 0..100 {
            assert!(backoff.next_delay() > Duration::ZERO);
        }
    }
}
