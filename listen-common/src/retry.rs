use std::time;

#[derive(Copy, Clone, Debug)]
/// The retry policy used when a batch insert fails with a transient error.
pub struct RetryPolicy {
    /// Total number of insert attempts for a batch, the first one included.
    max_attempts: u32,
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: Option<time::Duration>,
    /// Upper bound of the random delay added to every backoff.
    jitter: time::Duration,
}

impl RetryPolicy {
    pub fn build(max_attempts: u32, backoff_coefficient: u32, initial_interval: time::Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_coefficient,
            initial_interval,
            maximum_interval: None,
            jitter: time::Duration::from_millis(50),
        }
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> Self {
        self.maximum_interval = Some(interval);
        self
    }

    pub fn jitter(mut self, jitter: time::Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether another attempt is allowed after `attempt` (1-based) failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Backoff before the retry following `attempt` (1-based), without jitter.
    pub fn retry_interval(&self, attempt: u32) -> time::Duration {
        let exponent = attempt.saturating_sub(1);
        let candidate_interval = self
            .backoff_coefficient
            .checked_pow(exponent)
            .and_then(|factor| self.initial_interval.checked_mul(factor))
            .unwrap_or(time::Duration::MAX);

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }

    /// Backoff with random jitter, to spread the retries of concurrent workers.
    pub fn retry_interval_with_jitter(&self, attempt: u32) -> time::Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::random::<u64>() % jitter_ms
        };
        self.retry_interval(attempt)
            .saturating_add(time::Duration::from_millis(jitter))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_millis(500),
            maximum_interval: Some(time::Duration::from_secs(10)),
            jitter: time::Duration::from_millis(50),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_interval_progression_and_cap() {
        let policy = RetryPolicy::build(5, 2, time::Duration::from_secs(1))
            .maximum_interval(time::Duration::from_secs(5));

        let cases = vec![(1, 1), (2, 2), (3, 4), (4, 5), (30, 5)];
        for (attempt, expected_secs) in cases {
            assert_eq!(
                policy.retry_interval(attempt).as_secs(),
                expected_secs,
                "attempt {attempt}"
            );
        }
    }

    #[test]
    fn test_retry_interval_without_cap_saturates() {
        let policy = RetryPolicy::build(5, 10, time::Duration::from_secs(1));
        assert_eq!(policy.retry_interval(2), time::Duration::from_secs(10));
        assert_eq!(policy.retry_interval(100), time::Duration::MAX);
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::build(3, 2, time::Duration::from_millis(1));
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));

        // zero attempts still means one try
        let policy = RetryPolicy::build(0, 2, time::Duration::from_millis(1));
        assert_eq!(policy.max_attempts(), 1);
        assert!(!policy.should_retry(1));
    }

    #[test]
    fn test_jitter_is_bounded() {
        let policy = RetryPolicy::build(3, 2, time::Duration::from_millis(100))
            .jitter(time::Duration::from_millis(10));
        for _ in 0..20 {
            let interval = policy.retry_interval_with_jitter(1);
            assert!(interval >= time::Duration::from_millis(100));
            assert!(interval < time::Duration::from_millis(110));
        }

        let policy = policy.jitter(time::Duration::ZERO);
        assert_eq!(
            policy.retry_interval_with_jitter(2),
            time::Duration::from_millis(200)
        );
    }
}
