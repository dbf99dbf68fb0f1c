//! Retry policy
//!
//! Truncated exponential backoff:
//! `delay(attempt) = base × multiplier × 2^(attempt − 1)`, capped at `max_delay`.
//! Attempt zero or below returns `base`. Jitter exists but is off by default so
//! the schedule is deterministic.

use rand::Rng;
use std::time::Duration;

use crate::error::LlmError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub retryable_statuses: Vec<u16>,
    pub use_jitter: bool,
    /// Maximum jitter fraction (0.0 to 1.0)
    pub jitter_factor: f64,
    /// Honor a provider `Retry-After` when it is longer than the computed delay.
    pub respect_retry_after: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            retryable_statuses: vec![429, 500, 502, 503, 504],
            use_jitter: false,
            jitter_factor: 0.1,
            respect_retry_after: true,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self::default().with_max_attempts(0)
    }

    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub const fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_retryable_statuses(mut self, statuses: impl Into<Vec<u16>>) -> Self {
        self.retryable_statuses = statuses.into();
        self
    }

    pub const fn with_jitter(mut self, use_jitter: bool) -> Self {
        self.use_jitter = use_jitter;
        self
    }

    pub const fn with_jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    pub const fn with_respect_retry_after(mut self, respect: bool) -> Self {
        self.respect_retry_after = respect;
        self
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_statuses.contains(&status)
    }

    /// Whether a failed attempt should be retried. Network failures always
    /// qualify; HTTP failures only for the configured statuses.
    pub fn should_retry(&self, error: &LlmError) -> bool {
        match error.root() {
            LlmError::Cancelled | LlmError::TimeoutError(_) => false,
            LlmError::HttpError(_) | LlmError::ConnectionError(_) => true,
            _ => error
                .status_code()
                .is_some_and(|s| self.is_retryable_status(s)),
        }
    }

    /// Backoff before retry number `attempt` (1-based).
    pub fn calculate_delay(&self, attempt: i64) -> Duration {
        let delay = backoff(
            self.initial_delay,
            self.max_delay,
            self.backoff_multiplier,
            attempt,
        );
        if self.use_jitter {
            self.add_jitter(delay).min(self.max_delay)
        } else {
            delay
        }
    }

    /// Delay to wait after `error` on attempt `attempt`, preferring a longer
    /// server-provided `Retry-After`, still bounded by `max_delay`.
    pub fn delay_for(&self, attempt: i64, error: &LlmError) -> Duration {
        let computed = self.calculate_delay(attempt);
        match error.retry_after() {
            Some(hint) if self.respect_retry_after => hint.max(computed).min(self.max_delay),
            _ => computed,
        }
    }

    fn add_jitter(&self, delay: Duration) -> Duration {
        let mut rng = rand::thread_rng();
        let jitter_range = delay.as_millis() as f64 * self.jitter_factor;
        if jitter_range <= 0.0 {
            return delay;
        }
        let jitter = rng.gen_range(-jitter_range..=jitter_range);
        let new_delay = delay.as_millis() as f64 + jitter;
        Duration::from_millis(new_delay.max(0.0) as u64)
    }
}

/// The raw backoff schedule, without jitter.
pub fn backoff(base: Duration, max: Duration, multiplier: f64, attempt: i64) -> Duration {
    if attempt <= 0 {
        return base.min(max);
    }
    // 2^62 seconds is far beyond any cap; clamp the exponent before powi.
    let exp = (attempt - 1).min(62) as i32;
    let secs = base.as_secs_f64() * multiplier * 2f64.powi(exp);
    if !secs.is_finite() || secs >= max.as_secs_f64() {
        return max;
    }
    Duration::from_secs_f64(secs.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_table() {
        let policy = RetryPolicy::default();
        let expected = [(0, 1), (1, 2), (2, 4), (3, 8), (4, 16), (5, 32), (6, 60), (100, 60)];
        for (attempt, secs) in expected {
            assert_eq!(
                policy.calculate_delay(attempt),
                Duration::from_secs(secs),
                "attempt {attempt}"
            );
        }
    }

    #[test]
    fn negative_attempt_returns_base() {
        assert_eq!(RetryPolicy::default().calculate_delay(-5), Duration::from_secs(1));
    }

    #[test]
    fn backoff_is_monotone_and_bounded() {
        let policy = RetryPolicy::default()
            .with_initial_delay(Duration::from_millis(250))
            .with_max_delay(Duration::from_secs(10))
            .with_backoff_multiplier(1.5);
        let mut prev = Duration::ZERO;
        for attempt in 0..200 {
            let d = policy.calculate_delay(attempt);
            assert!(d <= policy.max_delay);
            assert!(d >= prev, "attempt {attempt}: {d:?} < {prev:?}");
            prev = d;
        }
        assert_eq!(policy.calculate_delay(i64::MAX), policy.max_delay);
    }

    #[test]
    fn jitter_stays_under_cap() {
        let policy = RetryPolicy::default().with_jitter(true).with_jitter_factor(0.5);
        for attempt in 0..20 {
            assert!(policy.calculate_delay(attempt) <= policy.max_delay);
        }
    }

    #[test]
    fn retry_classification() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(&LlmError::api_error(503, "x")));
        assert!(policy.should_retry(&LlmError::rate_limited("x", None)));
        assert!(!policy.should_retry(&LlmError::api_error(501, "x")));
        assert!(!policy.should_retry(&LlmError::AuthenticationError("x".into())));
        assert!(policy.should_retry(&LlmError::ConnectionError("reset".into())));
        assert!(!policy.should_retry(&LlmError::Cancelled));
    }

    #[test]
    fn retry_after_hint_extends_delay() {
        let policy = RetryPolicy::default();
        let err = LlmError::rate_limited("slow down", Some(Duration::from_secs(9)));
        assert_eq!(policy.delay_for(1, &err), Duration::from_secs(9));
        let huge = LlmError::rate_limited("slow down", Some(Duration::from_secs(600)));
        assert_eq!(policy.delay_for(1, &huge), Duration::from_secs(60));
    }
}
