//! Reconnect policy for the relay link
//!
//! The transport retries a dropped or refused connection a bounded number of
//! times with exponential backoff, then gives up and reports the link closed.

use std::time::Duration;

/// Configuration for retry behavior
///
/// # Examples
///
/// ```rust
/// use callwire_signaling_transport::RetryConfig;
/// use std::time::Duration;
///
/// let config = RetryConfig::default();
/// assert_eq!(config.max_attempts, 5);
/// assert_eq!(config.initial_delay, Duration::from_millis(500));
///
/// let fixed = RetryConfig {
///     use_jitter: false,
///     ..RetryConfig::default()
/// };
/// assert_eq!(fixed.delay_for_attempt(1), Duration::from_millis(500));
/// assert_eq!(fixed.delay_for_attempt(2), Duration::from_secs(1));
/// ```
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of consecutive failed attempts before giving up
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Whether to add ±10% jitter to delays
    pub use_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryConfig {
    /// Tight policy for in-process links and tests
    pub fn quick() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(200),
            backoff_multiplier: 2.0,
            use_jitter: false,
        }
    }

    /// Never retry; the first failure is final
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::quick()
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);

        let actual = if self.use_jitter {
            let jitter = (rand::random::<f64>() - 0.5) * 0.2; // ±10% jitter
            capped * (1.0 + jitter)
        } else {
            capped
        };
        Duration::from_millis(actual.max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_is_capped() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
            use_jitter: false,
        };

        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(4), Duration::from_millis(800));
        assert_eq!(config.delay_for_attempt(5), Duration::from_millis(1000));
        assert_eq!(config.delay_for_attempt(30), Duration::from_millis(1000));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(10),
            ..RetryConfig::default()
        };
        for _ in 0..50 {
            let delay = config.delay_for_attempt(1).as_millis();
            assert!((900..=1100).contains(&delay), "delay {} out of range", delay);
        }
    }
}
