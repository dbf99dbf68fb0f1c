//! Request context
//!
//! Every blocking operation takes a `RequestContext`: a cancellation token the
//! caller may trigger at any time, plus an optional absolute deadline. Both are
//! observed at each suspension point (network I/O, backoff sleeps, rate-limit
//! waits, OAuth polling).

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::LlmError;

#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context whose deadline is `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Share an existing token (for example one owned by an application shutdown path).
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Derived context: cancelling the parent cancels the child, not the reverse.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline_instant(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Fail fast when the context is already done.
    pub fn check(&self) -> Result<(), LlmError> {
        if self.is_cancelled() {
            return Err(LlmError::Cancelled);
        }
        if self.is_expired() {
            return Err(deadline_error());
        }
        Ok(())
    }

    /// Drive `fut` until it completes, the token fires, or the deadline passes.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, LlmError>
    where
        F: Future<Output = Result<T, LlmError>>,
    {
        self.check()?;
        let deadline = self.deadline;
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(LlmError::Cancelled),
            _ = sleep_until_opt(deadline) => Err(deadline_error()),
            res = fut => res,
        }
    }

    /// Sleep for `duration` unless interrupted. A sleep that would run past the
    /// deadline fails immediately instead of waiting.
    pub async fn sleep(&self, duration: Duration) -> Result<(), LlmError> {
        self.check()?;
        if let Some(remaining) = self.remaining()
            && remaining < duration
        {
            return Err(deadline_error());
        }
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(LlmError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

pub(crate) fn deadline_error() -> LlmError {
    LlmError::TimeoutError("context deadline exceeded".to_string())
}

pub(crate) async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}
