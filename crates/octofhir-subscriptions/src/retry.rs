//! Retry budget and backoff for retryable delivery failures.
//!
//! The delay after failed attempt `n` (1-based) is `initial × factor^(n-1)`,
//! clamped to `max`. The delay depends only on the attempt number.

use std::time::Duration;

use crate::config::RetryConfig;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per notification, including the first (>= 1)
    pub max_attempts: u32,
    pub initial: Duration,
    pub max: Duration,
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            initial: Duration::from_millis(cfg.initial_backoff_ms),
            max: Duration::from_millis(cfg.max_backoff_ms),
            factor: cfg.backoff_factor,
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt may follow the failed attempt `attempt`.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay to wait after the failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial.as_secs_f64() * self.factor.powi(exp);
        if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial: Duration::from_millis(100),
            max: Duration::from_secs(1),
            factor: 2.0,
        }
    }

    #[test]
    fn exponential_growth_is_capped() {
        let p = policy(10);
        assert_eq!(p.delay_after(1), Duration::from_millis(100));
        assert_eq!(p.delay_after(2), Duration::from_millis(200));
        assert_eq!(p.delay_after(3), Duration::from_millis(400));
        assert_eq!(p.delay_after(5), Duration::from_secs(1));
        assert_eq!(p.delay_after(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn budget_counts_total_attempts() {
        let p = policy(3);
        assert!(p.should_retry(1));
        assert!(p.should_retry(2));
        assert!(!p.should_retry(3));

        let single = policy(1);
        assert!(!single.should_retry(1));
    }

    #[test]
    fn built_from_config() {
        let cfg = RetryConfig {
            max_attempts: 0,
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
            backoff_factor: 3.0,
        };
        let p = RetryPolicy::from(&cfg);
        assert_eq!(p.max_attempts, 1);
        assert_eq!(p.delay_after(2), Duration::from_millis(30));
        assert_eq!(p.delay_after(3), Duration::from_millis(50));
    }
}
