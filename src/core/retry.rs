use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff settings used by the orchestrator when an engine call
/// reports `NeedsRetry` or an integrity failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_ms: u64,
    pub max_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_ms: 1000,
            max_ms: 30_000,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

impl RetryPolicy {
    /// Backoff before attempt `attempt + 1`, where `attempt` counts attempts made so far (>= 1).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let ms = self.base_ms.saturating_mul(1u64 << exponent).min(self.max_ms);
        Duration::from_millis(ms)
    }

    pub fn decide(&self, attempts_made: u32) -> RetryDecision {
        if attempts_made >= self.max_attempts.max(1) {
            RetryDecision::GiveUp
        } else {
            RetryDecision::RetryAfter(self.backoff_for(attempts_made))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = RetryPolicy {
            base_ms: 100,
            max_ms: 1000,
            max_attempts: 10,
        };
        let delays: Vec<u64> = (1..=6).map(|a| policy.backoff_for(a).as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn gives_up_at_attempt_cap() {
        let policy = RetryPolicy {
            base_ms: 10,
            max_ms: 100,
            max_attempts: 3,
        };
        assert_eq!(policy.decide(1), RetryDecision::RetryAfter(Duration::from_millis(10)));
        assert_eq!(policy.decide(2), RetryDecision::RetryAfter(Duration::from_millis(20)));
        assert_eq!(policy.decide(3), RetryDecision::GiveUp);
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(u32::MAX), Duration::from_millis(policy.max_ms));
    }
}
