//! Rate-limit bookkeeper
//!
//! Keeps the latest provider-reported record per model behind a single
//! reader/writer lock. Header parsing replaces a record under the write lock;
//! queries take the read lock.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;

use super::info::{Counter, RateLimitInfo};
use super::parsers::{GenericRateLimitParser, RateLimitParser};
use crate::context::RequestContext;
use crate::error::LlmError;

/// How long an exhausted counter with no reported reset blocks requests.
pub const DEFAULT_BLOCK_WINDOW: Duration = Duration::from_secs(60);

pub struct RateLimitTracker {
    provider: String,
    parser: Arc<dyn RateLimitParser>,
    records: RwLock<HashMap<String, RateLimitInfo>>,
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitTracker")
            .field("provider", &self.provider)
            .field("parser", &self.parser.name())
            .finish_non_exhaustive()
    }
}

fn to_std(d: chrono::Duration) -> Duration {
    d.to_std().unwrap_or(Duration::ZERO)
}

impl RateLimitTracker {
    pub fn new(provider: impl Into<String>, parser: Arc<dyn RateLimitParser>) -> Self {
        Self {
            provider: provider.into(),
            parser,
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn generic(provider: impl Into<String>) -> Self {
        Self::new(provider, Arc::new(GenericRateLimitParser))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, RateLimitInfo>> {
        match self.records.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, RateLimitInfo>> {
        match self.records.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Parse `headers` and replace the record for `model`. Returns the new record.
    pub fn update_from_headers(&self, model: &str, headers: &HeaderMap) -> Option<RateLimitInfo> {
        let info = self.parser.parse(headers, Utc::now())?;
        tracing::debug!(
            target: "infergate::ratelimit",
            provider = %self.provider,
            model,
            requests_remaining = ?info.requests.remaining,
            tokens_remaining = ?info.tokens.remaining,
            retry_after = ?info.retry_after,
            "rate limit updated"
        );
        self.write().insert(model.to_string(), info.clone());
        Some(info)
    }

    /// Record a retry-after window learned from a 429 without headers the parser understood.
    pub fn record_retry_after(&self, model: &str, wait: Duration) {
        let now = Utc::now();
        let until = chrono::Duration::from_std(wait)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let mut records = self.write();
        let entry = records.entry(model.to_string()).or_default();
        entry.retry_after = Some(entry.retry_after.map_or(until, |prev| prev.max(until)));
        entry.updated_at = Some(Utc::now());
        tracing::info!(target: "infergate::ratelimit", provider = %self.provider, model, wait_ms = wait.as_millis() as u64, "provider asked to back off");
    }

    pub fn get(&self, model: &str) -> Option<RateLimitInfo> {
        self.read().get(model).cloned()
    }

    pub fn clear(&self, model: &str) {
        self.write().remove(model);
    }

    pub fn can_make_request(&self, model: &str, estimated_tokens: u64) -> bool {
        self.wait_time_for(model, estimated_tokens).is_zero()
    }

    /// Time until a request for `model` could proceed.
    pub fn wait_time(&self, model: &str) -> Duration {
        self.wait_time_for(model, 0)
    }

    /// Time until the earliest reset among the constraints currently blocking
    /// a request costing `estimated_tokens`. Zero when nothing blocks.
    ///
    /// Other constraints may still block after that reset; `check_and_wait`
    /// re-checks in a loop.
    pub fn wait_time_for(&self, model: &str, estimated_tokens: u64) -> Duration {
        let records = self.read();
        let Some(info) = records.get(model) else {
            return Duration::ZERO;
        };
        blocking_wait(info, estimated_tokens, Utc::now())
    }

    /// Wait until the bookkeeper allows a request, or the context ends.
    pub async fn check_and_wait(
        &self,
        ctx: &RequestContext,
        model: &str,
        estimated_tokens: u64,
    ) -> Result<(), LlmError> {
        loop {
            let wait = self.wait_time_for(model, estimated_tokens);
            if wait.is_zero() {
                return Ok(());
            }
            tracing::info!(target: "infergate::ratelimit", provider = %self.provider, model, wait_ms = wait.as_millis() as u64, "waiting for rate limit reset");
            ctx.sleep(wait).await?;
        }
    }

    /// True when consumed / limit ≥ `fraction` for any reported counter.
    pub fn should_throttle(&self, model: &str, fraction: f64) -> bool {
        let records = self.read();
        let Some(info) = records.get(model) else {
            return false;
        };
        let now = Utc::now();
        info.counters()
            .iter()
            .filter_map(|c| c.consumed_fraction(now))
            .any(|used| used >= fraction)
    }
}

fn counter_wait(
    counter: &Counter,
    cost: u64,
    updated_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<Duration> {
    if !counter.would_exceed(cost, now) {
        return None;
    }
    let reset = counter.reset_at.or_else(|| {
        updated_at.and_then(|u| chrono::Duration::from_std(DEFAULT_BLOCK_WINDOW).ok().map(|w| u + w))
    })?;
    let wait = to_std(reset - now);
    (!wait.is_zero()).then_some(wait)
}

fn blocking_wait(info: &RateLimitInfo, estimated_tokens: u64, now: DateTime<Utc>) -> Duration {
    let mut earliest: Option<Duration> = None;
    let mut consider = |w: Duration| {
        earliest = Some(earliest.map_or(w, |e| e.min(w)));
    };
    if let Some(until) = info.retry_after
        && until > now
    {
        let w = to_std(until - now);
        if !w.is_zero() {
            consider(w);
        }
    }
    let checks = [
        (&info.requests, 1),
        (&info.daily_requests, 1),
        (&info.tokens, estimated_tokens),
        (&info.input_tokens, estimated_tokens),
        (&info.daily_tokens, estimated_tokens),
        (&info.output_tokens, 0),
    ];
    for (counter, cost) in checks {
        if let Some(w) = counter_wait(counter, cost, info.updated_at, now) {
            consider(w);
        }
    }
    earliest.unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::parsers::{AnthropicRateLimitParser, OpenAiRateLimitParser};
    use reqwest::header::HeaderValue;
    use tokio_test::{assert_err, assert_ok};
    use tracing_test::traced_test;

    fn openai_tracker() -> RateLimitTracker {
        RateLimitTracker::new("openai", Arc::new(OpenAiRateLimitParser))
    }

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.insert(*k, HeaderValue::from_static(v));
        }
        h
    }

    #[test]
    fn unknown_model_is_allowed() {
        let t = openai_tracker();
        assert!(t.can_make_request("gpt-4o", 1_000_000));
        assert_eq!(t.wait_time("gpt-4o"), Duration::ZERO);
        assert!(!t.should_throttle("gpt-4o", 0.8));
    }

    #[test]
    fn exhausted_requests_block_until_reset() {
        let t = openai_tracker();
        t.update_from_headers(
            "gpt-4o",
            &headers(&[
                ("x-ratelimit-limit-requests", "60"),
                ("x-ratelimit-remaining-requests", "0"),
                ("x-ratelimit-reset-requests", "30s"),
            ]),
        );
        assert!(!t.can_make_request("gpt-4o", 0));
        let w = t.wait_time("gpt-4o");
        assert!(w > Duration::from_secs(28) && w <= Duration::from_secs(30));
        assert!(t.can_make_request("other-model", 0));
    }

    #[test]
    fn token_budget_is_compared_with_estimate() {
        let t = openai_tracker();
        t.update_from_headers(
            "m",
            &headers(&[
                ("x-ratelimit-limit-tokens", "10000"),
                ("x-ratelimit-remaining-tokens", "500"),
                ("x-ratelimit-reset-tokens", "1m"),
            ]),
        );
        assert!(t.can_make_request("m", 400));
        assert!(!t.can_make_request("m", 600));
        assert!(t.should_throttle("m", 0.8));
        assert!(!t.should_throttle("m", 0.99));
    }

    #[test]
    fn elapsed_reset_restores_budget() {
        let t = RateLimitTracker::new("anthropic", Arc::new(AnthropicRateLimitParser));
        t.update_from_headers(
            "claude",
            &headers(&[
                ("anthropic-ratelimit-requests-limit", "50"),
                ("anthropic-ratelimit-requests-remaining", "0"),
                ("anthropic-ratelimit-requests-reset", "2001-01-01T00:00:00Z"),
            ]),
        );
        assert!(t.can_make_request("claude", 0));
    }

    #[test]
    #[traced_test]
    fn retry_after_blocks() {
        let t = RateLimitTracker::generic("ollama");
        t.record_retry_after("llama3", Duration::from_secs(5));
        assert!(!t.can_make_request("llama3", 0));
        assert!(t.wait_time("llama3") <= Duration::from_secs(5));
        assert!(logs_contain("provider asked to back off"));
    }

    #[test]
    fn wait_time_is_earliest_blocking_reset() {
        let t = openai_tracker();
        t.update_from_headers(
            "gpt-4o",
            &headers(&[
                ("x-ratelimit-limit-requests", "60"),
                ("x-ratelimit-remaining-requests", "0"),
                ("x-ratelimit-reset-requests", "10s"),
                ("x-ratelimit-limit-tokens", "1000"),
                ("x-ratelimit-remaining-tokens", "0"),
                ("x-ratelimit-reset-tokens", "1m"),
            ]),
        );
        assert!(!t.can_make_request("gpt-4o", 1));
        let w = t.wait_time_for("gpt-4o", 1);
        assert!(w > Duration::from_secs(8) && w <= Duration::from_secs(10), "{w:?}");
    }

    #[tokio::test]
    async fn check_and_wait_outlasts_every_blocking_counter() {
        let t = openai_tracker();
        t.update_from_headers(
            "m",
            &headers(&[
                ("x-ratelimit-remaining-requests", "0"),
                ("x-ratelimit-reset-requests", "30ms"),
                ("x-ratelimit-remaining-tokens", "0"),
                ("x-ratelimit-reset-tokens", "150ms"),
            ]),
        );
        let started = std::time::Instant::now();
        assert_ok!(t.check_and_wait(&RequestContext::new(), "m", 1).await);
        assert!(started.elapsed() >= Duration::from_millis(120));
        assert!(t.can_make_request("m", 1));
    }

    #[test]
    fn unrepresentable_retry_after_blocks_without_overflow() {
        let t = RateLimitTracker::generic("x");
        t.record_retry_after("m", Duration::MAX);
        assert!(!t.can_make_request("m", 0));
        assert!(t.wait_time("m") > Duration::from_secs(86_400 * 365));
    }

    #[test]
    fn update_replaces_record() {
        let t = openai_tracker();
        t.update_from_headers("m", &headers(&[("x-ratelimit-remaining-requests", "0")]));
        assert!(!t.can_make_request("m", 0));
        t.update_from_headers("m", &headers(&[("x-ratelimit-remaining-requests", "10")]));
        assert!(t.can_make_request("m", 0));
    }

    #[tokio::test]
    async fn check_and_wait_is_cancellable() {
        let t = RateLimitTracker::generic("x");
        t.record_retry_after("m", Duration::from_secs(30));
        let ctx = RequestContext::new();
        let c = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            c.cancel();
        });
        let err = assert_err!(t.check_and_wait(&ctx, "m", 0).await);
        assert!(matches!(err, LlmError::Cancelled));
    }

    #[tokio::test]
    async fn check_and_wait_returns_after_short_window() {
        let t = RateLimitTracker::generic("x");
        t.record_retry_after("m", Duration::from_millis(30));
        assert_ok!(t.check_and_wait(&RequestContext::new(), "m", 0).await);
        assert!(t.can_make_request("m", 0));
    }
}
