use std::time::Duration;

use crate::error::{Error, Result};

/// Consecutive failure counter with linear backoff.
///
/// Failure `n` waits `n * step`; the failure that brings the count to
/// `max_attempts` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    count: u32,
    max_attempts: u32,
    step: Duration,
}

impl RetryState {
    pub fn new(max_attempts: u32, step: Duration) -> Self {
        Self {
            count: 0,
            max_attempts: max_attempts.max(1),
            step,
        }
    }

    /// Record one failed attempt and return how long to wait before the next.
    pub fn record_failure(&mut self) -> Result<Duration> {
        self.count += 1;
        if self.count >= self.max_attempts {
            return Err(Error::PowerExhausted {
                attempts: self.count,
            });
        }
        Ok(self.step * self.count)
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_linearly_until_exhausted() {
        let mut retry = RetryState::new(4, Duration::from_millis(250));
        assert_eq!(retry.record_failure().unwrap(), Duration::from_millis(250));
        assert_eq!(retry.record_failure().unwrap(), Duration::from_millis(500));
        assert_eq!(retry.record_failure().unwrap(), Duration::from_millis(750));
        match retry.record_failure() {
            Err(Error::PowerExhausted { attempts }) => assert_eq!(attempts, 4),
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[test]
    fn success_resets_the_count() {
        let mut retry = RetryState::new(2, Duration::from_millis(1));
        retry.record_failure().unwrap();
        retry.reset();
        assert_eq!(retry.count(), 0);
        assert!(retry.record_failure().is_ok());
        assert!(retry.record_failure().is_err());
    }
}
