//! Provider-specific rate-limit header parsers.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::HeaderMap;

use super::info::{Counter, RateLimitInfo};
use crate::error::parse_retry_after;

pub trait RateLimitParser: Send + Sync {
    fn name(&self) -> &'static str;

    /// Extract whatever the provider reported; `None` when no rate-limit
    /// headers are present.
    fn parse(&self, headers: &HeaderMap, now: DateTime<Utc>) -> Option<RateLimitInfo>;
}

static DURATION_PART: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(\d+(?:\.\d+)?)(ms|h|m|s)").ok());

/// Parse durations like `1s`, `6m0s`, `20ms`, `1h2m3.5s`, or a bare number of seconds.
/// Negative, non-finite and out-of-range values yield `None`.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(secs) = value.parse::<f64>() {
        return Duration::try_from_secs_f64(secs).ok();
    }
    let re = DURATION_PART.as_ref()?;
    let mut total = 0f64;
    let mut consumed = 0usize;
    for cap in re.captures_iter(value) {
        let whole = cap.get(0)?;
        if whole.start() != consumed {
            return None;
        }
        consumed = whole.end();
        let n: f64 = cap[1].parse().ok()?;
        total += match &cap[2] {
            "h" => n * 3600.0,
            "m" => n * 60.0,
            "s" => n,
            "ms" => n / 1000.0,
            _ => return None,
        };
    }
    if consumed != value.len() || consumed == 0 {
        return None;
    }
    Duration::try_from_secs_f64(total).ok()
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    header(headers, name).and_then(|v| {
        v.parse::<u64>()
            .ok()
            .or_else(|| v.parse::<f64>().ok().map(|f| f.max(0.0) as u64))
    })
}

/// `now + d`, or `None` when the instant falls outside chrono's range.
fn after(now: DateTime<Utc>, d: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
}

fn reset_relative(headers: &HeaderMap, name: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    header(headers, name)
        .and_then(parse_duration)
        .and_then(|d| after(now, d))
}

fn reset_rfc3339(headers: &HeaderMap, name: &str) -> Option<DateTime<Utc>> {
    header(headers, name)
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|d| d.with_timezone(&Utc))
}

fn reset_epoch(headers: &HeaderMap, name: &str) -> Option<DateTime<Utc>> {
    let raw = header_u64(headers, name)?;
    // Epoch milliseconds are 13 digits today; anything smaller is seconds.
    if raw >= 100_000_000_000 {
        Utc.timestamp_millis_opt(raw as i64).single()
    } else {
        Utc.timestamp_opt(raw as i64, 0).single()
    }
}

fn retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Some(ms) = header(headers, "retry-after-ms").and_then(|v| v.parse::<f64>().ok()) {
        return Duration::try_from_secs_f64(ms / 1000.0)
            .ok()
            .and_then(|d| after(now, d));
    }
    header(headers, "retry-after")
        .and_then(parse_retry_after)
        .and_then(|d| after(now, d))
}

fn collect_raw(headers: &HeaderMap, prefixes: &[&str]) -> std::collections::HashMap<String, String> {
    headers
        .iter()
        .filter(|(k, _)| {
            let k = k.as_str();
            k == "retry-after" || k == "retry-after-ms" || prefixes.iter().any(|p| k.starts_with(p))
        })
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect()
}

fn finish(mut info: RateLimitInfo, now: DateTime<Utc>) -> Option<RateLimitInfo> {
    if info.is_empty() {
        return None;
    }
    info.updated_at = Some(now);
    Some(info)
}

/// `x-ratelimit-{limit,remaining,reset}-{requests,tokens}` with Go-style durations.
/// Used by OpenAI, Qwen (DashScope compatible mode) and most compatible servers.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenAiRateLimitParser;

impl RateLimitParser for OpenAiRateLimitParser {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn parse(&self, headers: &HeaderMap, now: DateTime<Utc>) -> Option<RateLimitInfo> {
        let info = RateLimitInfo {
            requests: Counter {
                limit: header_u64(headers, "x-ratelimit-limit-requests"),
                remaining: header_u64(headers, "x-ratelimit-remaining-requests"),
                reset_at: reset_relative(headers, "x-ratelimit-reset-requests", now),
            },
            tokens: Counter {
                limit: header_u64(headers, "x-ratelimit-limit-tokens"),
                remaining: header_u64(headers, "x-ratelimit-remaining-tokens"),
                reset_at: reset_relative(headers, "x-ratelimit-reset-tokens", now),
            },
            retry_after: retry_after(headers, now),
            raw: collect_raw(headers, &["x-ratelimit-"]),
            ..Default::default()
        };
        finish(info, now)
    }
}

/// `anthropic-ratelimit-*` with RFC 3339 reset instants and an input/output split.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnthropicRateLimitParser;

impl AnthropicRateLimitParser {
    fn counter(headers: &HeaderMap, kind: &str) -> Counter {
        Counter {
            limit: header_u64(headers, &format!("anthropic-ratelimit-{kind}-limit")),
            remaining: header_u64(headers, &format!("anthropic-ratelimit-{kind}-remaining")),
            reset_at: reset_rfc3339(headers, &format!("anthropic-ratelimit-{kind}-reset")),
        }
    }
}

impl RateLimitParser for AnthropicRateLimitParser {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn parse(&self, headers: &HeaderMap, now: DateTime<Utc>) -> Option<RateLimitInfo> {
        let info = RateLimitInfo {
            requests: Self::counter(headers, "requests"),
            tokens: Self::counter(headers, "tokens"),
            input_tokens: Self::counter(headers, "input-tokens"),
            output_tokens: Self::counter(headers, "output-tokens"),
            retry_after: retry_after(headers, now),
            raw: collect_raw(headers, &["anthropic-ratelimit-"]),
            ..Default::default()
        };
        finish(info, now)
    }
}

/// Cerebras: daily request budget and per-minute token budget, resets in seconds.
#[derive(Debug, Default, Clone, Copy)]
pub struct CerebrasRateLimitParser;

impl RateLimitParser for CerebrasRateLimitParser {
    fn name(&self) -> &'static str {
        "cerebras"
    }

    fn parse(&self, headers: &HeaderMap, now: DateTime<Utc>) -> Option<RateLimitInfo> {
        let info = RateLimitInfo {
            daily_requests: Counter {
                limit: header_u64(headers, "x-ratelimit-limit-requests-day"),
                remaining: header_u64(headers, "x-ratelimit-remaining-requests-day"),
                reset_at: reset_relative(headers, "x-ratelimit-reset-requests-day", now),
            },
            tokens: Counter {
                limit: header_u64(headers, "x-ratelimit-limit-tokens-minute"),
                remaining: header_u64(headers, "x-ratelimit-remaining-tokens-minute"),
                reset_at: reset_relative(headers, "x-ratelimit-reset-tokens-minute", now),
            },
            retry_after: retry_after(headers, now),
            raw: collect_raw(headers, &["x-ratelimit-"]),
            ..Default::default()
        };
        finish(info, now)
    }
}

/// OpenRouter: `X-RateLimit-{Limit,Remaining,Reset}` with an epoch-millisecond reset.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenRouterRateLimitParser;

impl RateLimitParser for OpenRouterRateLimitParser {
    fn name(&self) -> &'static str {
        "openrouter"
    }

    fn parse(&self, headers: &HeaderMap, now: DateTime<Utc>) -> Option<RateLimitInfo> {
        let info = RateLimitInfo {
            requests: Counter {
                limit: header_u64(headers, "x-ratelimit-limit"),
                remaining: header_u64(headers, "x-ratelimit-remaining"),
                reset_at: reset_epoch(headers, "x-ratelimit-reset"),
            },
            retry_after: retry_after(headers, now),
            raw: collect_raw(headers, &["x-ratelimit-"]),
            ..Default::default()
        };
        finish(info, now)
    }
}

/// Only `Retry-After`; for providers without documented quota headers.
#[derive(Debug, Default, Clone, Copy)]
pub struct GenericRateLimitParser;

impl RateLimitParser for GenericRateLimitParser {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn parse(&self, headers: &HeaderMap, now: DateTime<Utc>) -> Option<RateLimitInfo> {
        let info = RateLimitInfo {
            retry_after: retry_after(headers, now),
            raw: collect_raw(headers, &[]),
            ..Default::default()
        };
        finish(info, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.insert(*k, HeaderValue::from_static(v));
        }
        h
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("1s"), Some(Duration::from_secs(1)));
        assert_eq!(parse_duration("6m0s"), Some(Duration::from_secs(360)));
        assert_eq!(parse_duration("20ms"), Some(Duration::from_millis(20)));
        assert_eq!(parse_duration("1h2m3.5s"), Some(Duration::from_secs_f64(3723.5)));
        assert_eq!(parse_duration("42"), Some(Duration::from_secs(42)));
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration("5x"), None);
    }

    #[test]
    fn out_of_range_values_carry_no_information() {
        assert_eq!(parse_duration("1e30"), None);
        assert_eq!(parse_duration("inf"), None);
        assert_eq!(parse_duration("-3"), None);
        assert_eq!(parse_duration("99999999999999999999h"), None);

        let now = Utc::now();
        let h = headers(&[
            ("x-ratelimit-remaining-requests", "0"),
            ("x-ratelimit-reset-requests", "1e30"),
            ("retry-after-ms", "inf"),
        ]);
        let info = OpenAiRateLimitParser.parse(&h, now).unwrap();
        assert_eq!(info.requests.remaining, Some(0));
        assert_eq!(info.requests.reset_at, None);
        assert_eq!(info.retry_after, None);

        // Representable as a duration, but past chrono's last instant.
        let h = headers(&[("retry-after", "9999999999999")]);
        assert!(GenericRateLimitParser.parse(&h, now).is_none());
    }

    #[test]
    fn openai_headers() {
        let now = Utc::now();
        let h = headers(&[
            ("x-ratelimit-limit-requests", "60"),
            ("x-ratelimit-remaining-requests", "59"),
            ("x-ratelimit-reset-requests", "1s"),
            ("x-ratelimit-limit-tokens", "150000"),
            ("x-ratelimit-remaining-tokens", "149984"),
            ("x-ratelimit-reset-tokens", "6m0s"),
        ]);
        let info = OpenAiRateLimitParser.parse(&h, now).unwrap();
        assert_eq!(info.requests.limit, Some(60));
        assert_eq!(info.requests.remaining, Some(59));
        assert_eq!(info.tokens.reset_at, Some(now + chrono::Duration::seconds(360)));
        assert_eq!(info.raw.len(), 6);
    }

    #[test]
    fn anthropic_headers() {
        let now = Utc::now();
        let h = headers(&[
            ("anthropic-ratelimit-requests-limit", "50"),
            ("anthropic-ratelimit-requests-remaining", "0"),
            ("anthropic-ratelimit-requests-reset", "2030-01-01T00:00:00Z"),
            ("anthropic-ratelimit-input-tokens-remaining", "1000"),
            ("anthropic-ratelimit-output-tokens-remaining", "500"),
            ("retry-after", "12"),
        ]);
        let info = AnthropicRateLimitParser.parse(&h, now).unwrap();
        assert_eq!(info.requests.remaining, Some(0));
        assert_eq!(
            info.requests.reset_at.unwrap().to_rfc3339(),
            "2030-01-01T00:00:00+00:00"
        );
        assert_eq!(info.input_tokens.remaining, Some(1000));
        assert_eq!(info.output_tokens.remaining, Some(500));
        assert_eq!(info.retry_after, Some(now + chrono::Duration::seconds(12)));
    }

    #[test]
    fn cerebras_headers() {
        let now = Utc::now();
        let h = headers(&[
            ("x-ratelimit-limit-requests-day", "14400"),
            ("x-ratelimit-remaining-requests-day", "14399"),
            ("x-ratelimit-reset-requests-day", "33011.382867"),
            ("x-ratelimit-limit-tokens-minute", "60000"),
            ("x-ratelimit-remaining-tokens-minute", "59000"),
            ("x-ratelimit-reset-tokens-minute", "11.382867"),
        ]);
        let info = CerebrasRateLimitParser.parse(&h, now).unwrap();
        assert_eq!(info.daily_requests.limit, Some(14400));
        assert_eq!(info.tokens.remaining, Some(59000));
        assert!(info.tokens.reset_at.unwrap() > now);
    }

    #[test]
    fn openrouter_epoch_millis() {
        let now = Utc::now();
        let h = headers(&[
            ("x-ratelimit-limit", "20"),
            ("x-ratelimit-remaining", "19"),
            ("x-ratelimit-reset", "1893456000000"),
        ]);
        let info = OpenRouterRateLimitParser.parse(&h, now).unwrap();
        assert_eq!(info.requests.reset_at.unwrap().timestamp(), 1_893_456_000);
    }

    #[test]
    fn no_headers_means_no_record() {
        assert!(GenericRateLimitParser.parse(&HeaderMap::new(), Utc::now()).is_none());
        assert!(OpenAiRateLimitParser.parse(&HeaderMap::new(), Utc::now()).is_none());
    }
}
