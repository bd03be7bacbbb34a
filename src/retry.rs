//! Retry configuration, requeue decisions and reconnect backoff.

use serde::{Deserialize, Serialize};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{HandlerError, MqError};

/// Retries after the first attempt, i.e. three deliveries in total.
pub const DEFAULT_RETRY_COUNT: u32 = 2;
/// Upper bound accepted for a configured retry count.
pub const MAX_RETRY_COUNT: u32 = 100;

/// First reconnect backoff step.
pub const BASE_BACKOFF: Duration = Duration::from_millis(100);
/// Largest single reconnect backoff step.
pub const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Configuration for message redelivery attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    ///
    /// # Arguments
    /// * `max_retries` - How many times a failed message is requeued before it
    ///   is dead-lettered.
    pub fn new(max_retries: u32) -> Result<Self, MqError> {
        if max_retries > MAX_RETRY_COUNT {
            return Err(MqError::config(format!(
                "retry count must be at most {MAX_RETRY_COUNT}, got {max_retries}"
            )));
        }
        Ok(Self { max_retries })
    }

    /// Checks if a failed message should go back on its inbound queue.
    ///
    /// Unretryable errors are never requeued, whatever the attempt count.
    pub fn should_requeue(&self, retry_attempts: u32, error: &HandlerError) -> bool {
        error.is_retryable() && retry_attempts < self.max_retries
    }

    /// Returns a string slice describing the attempt for logging purposes.
    pub fn attempt_type(&self, retry_attempts: u32) -> &'static str {
        if retry_attempts == 0 {
            "initial"
        } else if retry_attempts < self.max_retries {
            "retry"
        } else {
            "final"
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_RETRY_COUNT,
        }
    }
}

/// Capped exponential backoff: 100ms, 200ms, 400ms ... up to 10s.
pub fn backoff_delay(attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    BASE_BACKOFF.saturating_mul(factor).min(MAX_BACKOFF)
}

/// Re-runs `check` with growing pauses until it returns true or `timeout`
/// elapses. Returns the last result.
pub fn retry_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    let mut attempt = 0;
    loop {
        if check() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep(backoff_delay(attempt).min(deadline - now));
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_default_retry_config() {
        assert_eq!(RetryConfig::default().max_retries, 2);
    }

    #[test]
    fn test_retry_count_validation() {
        assert!(RetryConfig::new(0).is_ok());
        assert!(RetryConfig::new(MAX_RETRY_COUNT).is_ok());
        assert!(matches!(
            RetryConfig::new(MAX_RETRY_COUNT + 1),
            Err(MqError::Config { .. })
        ));
    }

    #[test]
    fn test_should_requeue() {
        let config = RetryConfig::new(2).unwrap();
        let retryable = HandlerError::retryable("flaky");
        assert!(config.should_requeue(0, &retryable));
        assert!(config.should_requeue(1, &retryable));
        assert!(!config.should_requeue(2, &retryable));

        let unretryable = HandlerError::unretryable("bad");
        assert!(!config.should_requeue(0, &unretryable));
    }

    #[test]
    fn test_attempt_type() {
        let config = RetryConfig::default();
        assert_eq!(config.attempt_type(0), "initial");
        assert_eq!(config.attempt_type(1), "retry");
        assert_eq!(config.attempt_type(2), "final");
    }

    #[test]
    fn test_backoff_is_capped() {
        assert_eq!(backoff_delay(0), Duration::from_millis(100));
        assert_eq!(backoff_delay(1), Duration::from_millis(200));
        assert_eq!(backoff_delay(3), Duration::from_millis(800));
        assert_eq!(backoff_delay(7), MAX_BACKOFF);
        assert_eq!(backoff_delay(u32::MAX), MAX_BACKOFF);
    }

    #[test]
    fn test_retry_until() {
        let calls = Cell::new(0);
        assert!(retry_until(Duration::from_secs(2), || {
            calls.set(calls.get() + 1);
            calls.get() >= 3
        }));
        assert_eq!(calls.get(), 3);

        assert!(!retry_until(Duration::from_millis(50), || false));
    }
}
