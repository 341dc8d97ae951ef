use std::time;

#[derive(Copy, Clone, Debug)]
/// Backoff applied between feed restarts after an unrecoverable error.
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first restart.
    initial_interval: time::Duration,
    /// The maximum possible backoff between restarts.
    maximum_interval: time::Duration,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: time::Duration,
        maximum_interval: time::Duration,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
        }
    }

    /// Time to wait before restart number `attempt`, counting from zero.
    pub fn time_until_next_retry(&self, attempt: u32) -> time::Duration {
        let multiplier = self.backoff_coefficient.saturating_pow(attempt);
        self.initial_interval
            .checked_mul(multiplier)
            .map_or(self.maximum_interval, |candidate| {
                std::cmp::min(candidate, self.maximum_interval)
            })
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: time::Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn backoff_grows_until_capped() {
        let policy = RetryPolicy::new(2, Duration::from_millis(100), Duration::from_millis(1000));

        assert_eq!(policy.time_until_next_retry(0), Duration::from_millis(100));
        assert_eq!(policy.time_until_next_retry(1), Duration::from_millis(200));
        assert_eq!(policy.time_until_next_retry(3), Duration::from_millis(800));
        assert_eq!(policy.time_until_next_retry(4), Duration::from_millis(1000));
        assert_eq!(policy.time_until_next_retry(200), Duration::from_millis(1000));
    }
}
