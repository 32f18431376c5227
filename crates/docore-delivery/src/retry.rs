//! Backoff policy and retry decisions.
//!
//! The policy is a pure function from attempt number to wait duration plus a
//! separate attempt budget. All strategies are deterministic: a message
//! retried on one worker waits exactly as long as it would on any other.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::classify::FailureKind;

/// Retry policy for message delivery.
///
/// `max_attempts` counts every invocation of the handler, so the default of
/// three means one initial try and two retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of handler invocations, including the first.
    pub max_attempts: u32,

    /// Delay for the fixed strategy and step size for the others.
    pub base_delay: Duration,

    /// Upper bound applied to exponential and linear delays.
    pub max_delay: Duration,

    /// Strategy for calculating delays.
    pub backoff_strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_strategy: BackoffStrategy::Fixed,
        }
    }
}

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Same delay before every retry.
    Fixed,
    /// Delay doubles with each attempt.
    Exponential,
    /// Delay grows by `base_delay` with each attempt.
    Linear,
}

impl std::str::FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            "linear" => Ok(Self::Linear),
            other => Err(format!("unknown backoff strategy '{other}'")),
        }
    }
}

impl RetryPolicy {
    /// Fixed policy: `max_attempts` tries separated by `delay`.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            backoff_strategy: BackoffStrategy::Fixed,
        }
    }

    /// Wait before the attempt that follows `attempt` (1-based).
    ///
    /// Fixed ignores the attempt number entirely. Linear waits
    /// `base * attempt`, exponential `base * 2^(attempt-1)`; both are capped
    /// by `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self.backoff_strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => {
                std::cmp::min(self.base_delay.saturating_mul(attempt), self.max_delay)
            },
            BackoffStrategy::Exponential => {
                let exponent = (attempt - 1).min(20);
                let multiplier = 2_u32.saturating_pow(exponent);
                std::cmp::min(self.base_delay.saturating_mul(multiplier), self.max_delay)
            },
        }
    }

    /// Whether `attempt` used up the budget.
    pub const fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

/// Inputs to a retry decision for one failed attempt.
#[derive(Debug, Clone, Copy)]
pub struct RetryContext<'a> {
    /// Attempt that just failed (1-based).
    pub attempt_number: u32,
    /// Classification of the failure.
    pub kind: FailureKind,
    /// Policy to apply.
    pub policy: &'a RetryPolicy,
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait `delay`, then invoke the handler again.
    Retry {
        /// Time to wait before the next attempt
        delay: Duration,
    },
    /// Route to the dead-letter destination.
    GiveUp {
        /// Why no further attempt is made
        reason: GiveUpReason,
    },
}

/// Why a message is no longer retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    /// The failure can never succeed on retry.
    Terminal,
    /// Every allowed attempt failed.
    Exhausted {
        /// Attempts made
        attempts: u32,
    },
}

impl<'a> RetryContext<'a> {
    /// Creates a context for a failed attempt.
    pub const fn new(attempt_number: u32, kind: FailureKind, policy: &'a RetryPolicy) -> Self {
        Self { attempt_number, kind, policy }
    }

    /// Decides between another attempt and the dead-letter destination.
    ///
    /// Terminal failures give up immediately regardless of remaining budget.
    pub fn decide(&self) -> RetryDecision {
        if self.kind == FailureKind::Terminal {
            return RetryDecision::GiveUp { reason: GiveUpReason::Terminal };
        }

        if self.policy.is_exhausted(self.attempt_number) {
            return RetryDecision::GiveUp {
                reason: GiveUpReason::Exhausted { attempts: self.attempt_number },
            };
        }

        RetryDecision::Retry { delay: self.policy.delay(self.attempt_number) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_fixed_one_second_three_attempts() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.max_attempts, 3);
        for attempt in 1..=5 {
            assert_eq!(policy.delay(attempt), Duration::from_secs(1));
        }
    }

    #[test]
    fn exponential_backoff_doubles_until_capped() {
        let policy = RetryPolicy {
            backoff_strategy: BackoffStrategy::Exponential,
            max_delay: Duration::from_secs(6),
            ..RetryPolicy::default()
        };

        let delays: Vec<_> = (1..=5).map(|attempt| policy.delay(attempt)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(6),
                Duration::from_secs(6),
            ]
        );
    }

    #[test]
    fn linear_backoff_grows_by_base() {
        let policy = RetryPolicy {
            backoff_strategy: BackoffStrategy::Linear,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            ..RetryPolicy::default()
        };

        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(3), Duration::from_millis(1500));
        assert_eq!(policy.delay(100), Duration::from_secs(10));
    }

    #[test]
    fn terminal_failures_give_up_on_first_attempt() {
        let policy = RetryPolicy::default();
        let decision = RetryContext::new(1, FailureKind::Terminal, &policy).decide();

        assert_eq!(decision, RetryDecision::GiveUp { reason: GiveUpReason::Terminal });
    }

    #[test]
    fn retryable_failures_stop_at_budget() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(250));

        assert_eq!(
            RetryContext::new(2, FailureKind::Retryable, &policy).decide(),
            RetryDecision::Retry { delay: Duration::from_millis(250) }
        );
        assert_eq!(
            RetryContext::new(3, FailureKind::Retryable, &policy).decide(),
            RetryDecision::GiveUp { reason: GiveUpReason::Exhausted { attempts: 3 } }
        );
    }

    #[test]
    fn strategy_parses_case_insensitively() {
        assert_eq!("Fixed".parse::<BackoffStrategy>(), Ok(BackoffStrategy::Fixed));
        assert_eq!(" exponential ".parse::<BackoffStrategy>(), Ok(BackoffStrategy::Exponential));
        assert!("random".parse::<BackoffStrategy>().is_err());
    }
}
