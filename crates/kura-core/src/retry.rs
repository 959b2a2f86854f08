//! Bounded retry policy for queue delivery.

use crate::error::{Result, WorldError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How long to wait between delivery attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Retry immediately.
    None,
    /// Same delay before every retry.
    Fixed(Duration),
    /// Delay grows by `multiplier` per attempt, capped at `max_delay`.
    Exponential {
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: u32,
    },
}

/// Retry policy for transient delivery failures.
///
/// `max_attempts` counts the first delivery, so a policy of 1 never retries.
///
/// # Examples
///
/// ```
/// use kura_core::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential(5, Duration::from_millis(100));
/// assert_eq!(policy.max_attempts(), 5);
/// assert_eq!(policy.delay_after(1), Duration::from_millis(100));
/// assert_eq!(policy.delay_after(2), Duration::from_millis(200));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Backoff::Exponential {
                initial_delay: Duration::from_millis(250),
                max_delay: Duration::from_secs(30),
                multiplier: 2,
            },
        }
    }
}

impl RetryPolicy {
    /// Deliver once, never retry.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::None,
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Fixed(delay),
        }
    }

    /// Exponential backoff doubling from `initial_delay`, capped at 60s.
    pub fn exponential(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Exponential {
                initial_delay,
                max_delay: Duration::from_secs(60),
                multiplier: 2,
            },
        }
    }

    /// Exponential backoff with every knob, validated.
    pub fn exponential_backoff(
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: u32,
    ) -> Result<Self> {
        if max_attempts == 0 {
            return Err(WorldError::Configuration(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if multiplier == 0 || multiplier > 10 {
            return Err(WorldError::Configuration(
                "multiplier must be between 1 and 10".to_string(),
            ));
        }
        if max_delay < initial_delay {
            return Err(WorldError::Configuration(
                "max_delay must be >= initial_delay".to_string(),
            ));
        }
        Ok(Self {
            max_attempts,
            backoff: Backoff::Exponential {
                initial_delay,
                max_delay,
                multiplier,
            },
        })
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match &self.backoff {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(delay) => *delay,
            Backoff::Exponential {
                initial_delay,
                max_delay,
                multiplier,
            } => {
                let factor = multiplier.saturating_pow(attempt.saturating_sub(1));
                initial_delay.saturating_mul(factor).min(*max_delay)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_policy() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(1));
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(1));
    }

    #[test]
    fn test_exponential_caps_at_max_delay() {
        let policy = RetryPolicy::exponential_backoff(
            20,
            Duration::from_millis(100),
            Duration::from_secs(1),
            3,
        )
        .unwrap();
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(300));
        assert_eq!(policy.delay_after(3), Duration::from_millis(900));
        assert_eq!(policy.delay_after(4), Duration::from_secs(1));
        assert_eq!(policy.delay_after(19), Duration::from_secs(1));
    }

    #[test]
    fn test_validation() {
        let zero_multiplier = RetryPolicy::exponential_backoff(
            3,
            Duration::from_millis(100),
            Duration::from_secs(10),
            0,
        );
        assert!(zero_multiplier.is_err());
        let inverted =
            RetryPolicy::exponential_backoff(3, Duration::from_secs(2), Duration::from_secs(1), 2);
        assert!(inverted.is_err());
        assert_eq!(RetryPolicy::none().max_attempts(), 1);
        assert_eq!(RetryPolicy::fixed(0, Duration::ZERO).max_attempts(), 1);
    }
}
