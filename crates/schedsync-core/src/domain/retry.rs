//! Retry policy: bounded attempts with exponential backoff.
//!
//! Used twice: transient scrape failures inside one task attempt, and
//! transient store I/O errors.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,

    /// Base delay for the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            multiplier,
        }
    }

    /// Store writes: 3 attempts, 200ms / 400ms.
    pub fn store_default() -> Self {
        Self::new(3, Duration::from_millis(200), 2.0)
    }

    /// Scrape retries: 3 attempts, 2s / 4s.
    pub fn scrape_default() -> Self {
        Self::new(3, Duration::from_secs(2), 2.0)
    }

    /// No backoff at all (tests).
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, 1.0)
    }

    /// delay = base_delay * multiplier^(attempts - 1)
    ///
    /// `attempts` is the number of attempts already made (1-indexed).
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let delay_secs = base_secs * self.multiplier.powi(attempts.saturating_sub(1) as i32);
        Duration::from_secs_f64(delay_secs)
    }

    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::store_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_increases() {
        let policy = RetryPolicy::scrape_default();

        assert_eq!(policy.next_delay(1), Duration::from_secs(2));
        assert_eq!(policy.next_delay(2), Duration::from_secs(4));
        assert_eq!(policy.next_delay(3), Duration::from_secs(8));
    }

    #[test]
    fn attempts_are_bounded() {
        let policy = RetryPolicy::immediate(2);
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
        assert_eq!(policy.next_delay(1), Duration::ZERO);

        // at least one attempt is always made
        assert_eq!(RetryPolicy::immediate(0).max_attempts, 1);
    }
}
