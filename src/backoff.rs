//! Exponential backoff for reconnection attempts.

use std::time::Duration;

/// Default number of reconnection attempts before a camera is marked failed.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Base delay for exponential backoff (1 second).
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Maximum delay cap for exponential backoff (30 seconds).
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Calculate the delay before attempt number `attempt` (zero based).
///
/// Uses the formula: min(base * 2^attempt, max_delay)
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt)).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_backoff_doubles() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(1);
        assert_eq!(calculate_backoff(0, base, max), Duration::from_millis(100));
        assert_eq!(calculate_backoff(1, base, max), Duration::from_millis(200));
        assert_eq!(calculate_backoff(2, base, max), Duration::from_millis(400));
        assert_eq!(calculate_backoff(3, base, max), Duration::from_millis(800));
    }

    #[test]
    fn test_calculate_backoff_respects_max() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(1);
        assert_eq!(calculate_backoff(4, base, max), max);
        assert_eq!(calculate_backoff(40, base, max), max);
    }

    #[test]
    fn test_default_constants() {
        assert_eq!(DEFAULT_MAX_ATTEMPTS, 5);
        assert_eq!(DEFAULT_BACKOFF_BASE, Duration::from_secs(1));
        assert_eq!(DEFAULT_BACKOFF_MAX, Duration::from_secs(30));
    }
}
