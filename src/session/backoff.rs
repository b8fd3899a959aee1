use std::time::Duration;

/// Delays between connection attempts: starting at an initial delay, doubling after every
///  attempt, capped at a maximum.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
    num_attempts: u32,
}

impl ExponentialBackoff {
    pub fn new(initial_delay: Duration, max_delay: Duration, max_attempts: u32) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_delay,
            max_delay,
            max_attempts,
            num_attempts: 0,
        }
    }

    pub fn num_attempts(&self) -> u32 {
        self.num_attempts
    }

    /// Registers a failed attempt, returning the delay before the next one - or `None` if the
    ///  attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.num_attempts += 1;
        if self.num_attempts >= self.max_attempts {
            return None;
        }

        let factor = 1u32.checked_shl(self.num_attempts - 1).unwrap_or(u32::MAX);
        Some(self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay))
    }

    pub fn reset(&mut self) {
        self.num_attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::single_attempt(1, vec![])]
    #[case::two_attempts(2, vec![100])]
    #[case::doubling(4, vec![100, 200, 400])]
    #[case::capped(7, vec![100, 200, 400, 800, 1000, 1000])]
    fn test_delays(#[case] max_attempts: u32, #[case] expected_millis: Vec<u64>) {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(1), max_attempts);

        let mut delays = Vec::new();
        while let Some(delay) = backoff.next_delay() {
            delays.push(delay.as_millis() as u64);
        }
        assert_eq!(delays, expected_millis);
        assert_eq!(backoff.num_attempts(), max_attempts);
    }

    #[test]
    fn test_many_attempts_do_not_overflow() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(30), 100);
        for _ in 0..98 {
            assert!(backoff.next_delay().unwrap() <= Duration::from_secs(30));
        }
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(30)));
        assert_eq!(backoff.next_delay(), None);
    }

    #[test]
    fn test_reset() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(10), Duration::from_secs(1), 3);
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(10)));
    }
}
