//! Connection count and retry timing.

use std::time::Duration;

use crate::pool::MIN_WORKER_SIZE;

/// Exponential backoff between attempts on the same range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
        }
    }

    /// Retry without waiting.
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Delay before retry number `attempt` (1-based), doubling each time.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Number of connections to open at start.
///
/// Never more than one per [`MIN_WORKER_SIZE`] of the file, and at least one.
pub fn initial_connections(requested: usize, file_size: u64) -> usize {
    let by_size = usize::try_from(file_size / MIN_WORKER_SIZE).unwrap_or(usize::MAX);
    requested.min(by_size).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for(3), Duration::from_secs(1));
        assert_eq!(policy.delay_for(6), Duration::from_secs(5));
        assert_eq!(policy.delay_for(40), Duration::from_secs(5));
    }

    #[test]
    fn test_immediate_policy() {
        let policy = RetryPolicy::immediate();
        assert_eq!(policy.delay_for(1), Duration::ZERO);
        assert_eq!(policy.delay_for(19), Duration::ZERO);
    }

    #[test]
    fn test_initial_connections() {
        assert_eq!(initial_connections(4, 10_000_000), 4);
        assert_eq!(initial_connections(8, 10_000_000), 4);
        assert_eq!(initial_connections(2, 10_000_000), 2);
        assert_eq!(initial_connections(4, 3 * 1024 * 1024), 1);
        assert_eq!(initial_connections(4, 100), 1);
        assert_eq!(initial_connections(4, 0), 1);
    }
}
