//! Retry timing for per-item delivery attempts.

use std::time::Duration;

/// Exponential backoff with a cap and a fixed attempt budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Wait before attempt `attempt` (1-based).
    ///
    /// The first attempt runs immediately; attempt `n >= 2` waits
    /// `min(initial * 2^(n-2), max)`.
    pub fn delay_before_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let initial_ms = self.initial_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let shift = attempt - 2;
        let multiplier = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
        let delay_ms = initial_ms.saturating_mul(multiplier).min(max_ms);

        Duration::from_millis(delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_sequence_doubles_from_one_second() {
        let policy = BackoffPolicy::default();
        let delays: Vec<u64> = (1..=5)
            .map(|n| policy.delay_before_attempt(n).as_secs())
            .collect();
        assert_eq!(delays, vec![0, 1, 2, 4, 8]);
    }

    #[test]
    fn delay_is_capped() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_before_attempt(7), Duration::from_secs(30));
        assert_eq!(policy.delay_before_attempt(200), Duration::from_secs(30));
        assert_eq!(policy.delay_before_attempt(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn zeroth_attempt_has_no_delay() {
        assert_eq!(BackoffPolicy::default().delay_before_attempt(0), Duration::ZERO);
    }
}
