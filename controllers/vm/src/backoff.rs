//! # Per-key exponential backoff
//!
//! Tracks consecutive failures per work-queue key and produces the delay
//! before that key may be redelivered. The delay doubles with every failure
//! until it hits the cap; a successful pass forgets the key and the next
//! failure starts over at the base delay.
//!
//! Defaults follow the usual controller workqueue tuning: 5ms base, 1000s
//! cap.

use std::collections::HashMap;
use std::time::Duration;

/// Default first-failure delay.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Default delay cap.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Per-key exponential backoff calculator.
#[derive(Debug)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    failures: HashMap<String, u32>,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl ExponentialBackoff {
    /// Create a backoff with the given base delay and cap.
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: HashMap::new(),
        }
    }

    /// Delay before the next redelivery of `key`, advancing its failure
    /// count.
    pub fn next_delay(&mut self, key: &str) -> Duration {
        let failures = self.failures.entry(key.to_string()).or_insert(0);
        // 2^31 * 5ms is already far beyond any sane cap.
        let exponent = (*failures).min(31);
        *failures += 1;
        self.base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max)
    }

    /// Consecutive failures recorded for `key`.
    #[must_use]
    pub fn failures(&self, key: &str) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }

    /// Clear backoff state for `key` after a successful pass.
    pub fn forget(&mut self, key: &str) {
        self.failures.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_per_failure() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1000));

        assert_eq!(backoff.next_delay("v1"), Duration::from_millis(5));
        assert_eq!(backoff.next_delay("v1"), Duration::from_millis(10));
        assert_eq!(backoff.next_delay("v1"), Duration::from_millis(20));
        assert_eq!(backoff.next_delay("v1"), Duration::from_millis(40));
        assert_eq!(backoff.failures("v1"), 4);
    }

    #[test]
    fn test_keys_do_not_interfere() {
        let mut backoff = ExponentialBackoff::default();

        assert_eq!(backoff.next_delay("v1"), Duration::from_millis(5));
        assert_eq!(backoff.next_delay("v1"), Duration::from_millis(10));
        // A different key starts at the base delay.
        assert_eq!(backoff.next_delay("v2"), Duration::from_millis(5));
    }

    #[test]
    fn test_delay_caps_at_max() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(5), Duration::from_millis(50));

        assert_eq!(backoff.next_delay("v1"), Duration::from_millis(5));
        assert_eq!(backoff.next_delay("v1"), Duration::from_millis(10));
        assert_eq!(backoff.next_delay("v1"), Duration::from_millis(20));
        assert_eq!(backoff.next_delay("v1"), Duration::from_millis(40));
        // Would be 80ms, capped.
        assert_eq!(backoff.next_delay("v1"), Duration::from_millis(50));
        assert_eq!(backoff.next_delay("v1"), Duration::from_millis(50));
    }

    #[test]
    fn test_forget_resets_key() {
        let mut backoff = ExponentialBackoff::default();

        assert_eq!(backoff.next_delay("v1"), Duration::from_millis(5));
        assert_eq!(backoff.next_delay("v1"), Duration::from_millis(10));

        backoff.forget("v1");

        assert_eq!(backoff.failures("v1"), 0);
        assert_eq!(backoff.next_delay("v1"), Duration::from_millis(5));
    }
}
