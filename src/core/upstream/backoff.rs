//! Bounded exponential backoff for upstream reconnects.

use std::time::Duration;

/// Reconnection policy: a fixed number of attempts with exponentially growing,
/// capped delays. Attempt numbering starts at 1.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given attempt, or `None` once the budget is exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        Some(delay.min(self.max_delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_grow_exponentially_and_cap() {
        let policy = ReconnectPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        };
        assert_eq!(policy.delay_for(1), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay_for(3), Some(Duration::from_secs(4)));
        assert_eq!(policy.delay_for(4), Some(Duration::from_secs(8)));
        assert_eq!(policy.delay_for(5), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_budget_exhaustion() {
        let policy = ReconnectPolicy::default();
        assert!(policy.delay_for(3).is_some());
        assert_eq!(policy.delay_for(4), None);
        assert_eq!(policy.delay_for(0), None);
    }
}
