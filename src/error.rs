//! Error Handling Module
//!
//! A single error type, `LlmError`, flows back from every operation in the crate.
//! Variants follow the surface taxonomy used by all adapters (authentication,
//! not-found, invalid-request, rate-limit, server, network, cancelled,
//! deadline-exceeded, decoder). `LlmError::Contextual` decorates any of them with
//! the provider tag, operation name and HTTP status of the failing call.
//!
//! ```rust,ignore
//! use infergate::error::{LlmError, ErrorKind};
//!
//! let error = LlmError::api_error(503, "overloaded").with_context("ollama", "chat");
//! assert_eq!(error.kind(), ErrorKind::Server);
//! assert!(error.is_retryable());
//! ```

use reqwest::header::HeaderMap;
use std::time::Duration;
use thiserror::Error;

/// Coarse error kind mirroring the documented taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Authentication,
    NotFound,
    InvalidRequest,
    RateLimit,
    Server,
    Network,
    Cancelled,
    DeadlineExceeded,
    Decoder,
    Configuration,
    Unsupported,
    Io,
    Internal,
}

impl ErrorKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::NotFound => "not_found",
            Self::InvalidRequest => "invalid_request",
            Self::RateLimit => "rate_limit",
            Self::Server => "server",
            Self::Network => "network",
            Self::Cancelled => "cancelled",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Decoder => "decoder",
            Self::Configuration => "configuration",
            Self::Unsupported => "unsupported",
            Self::Io => "io",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
pub enum LlmError {
    #[error("Authentication error: {0}")]
    AuthenticationError(String),

    #[error("Missing API key: {0}")]
    MissingApiKey(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Rate limit exceeded: {message}")]
    RateLimitError {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("API error {code}: {message}")]
    ApiError {
        code: u16,
        message: String,
        details: Option<serde_json::Value>,
    },

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Timeout: {0}")]
    TimeoutError(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Stream error: {0}")]
    StreamError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("{provider} {operation} failed: {source}")]
    Contextual {
        provider: String,
        operation: String,
        status: Option<u16>,
        #[source]
        source: Box<LlmError>,
    },
}

impl LlmError {
    pub fn api_error(code: u16, message: impl Into<String>) -> Self {
        Self::ApiError {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn api_error_with_details(
        code: u16,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self::ApiError {
            code,
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::RateLimitError {
            message: message.into(),
            retry_after,
        }
    }

    /// Attach provider and operation. Re-wrapping an already contextual error
    /// keeps the innermost context and only fills a missing status.
    pub fn with_context(self, provider: impl Into<String>, operation: impl Into<String>) -> Self {
        match self {
            Self::Contextual { .. } => self,
            other => {
                let status = other.status_code();
                Self::Contextual {
                    provider: provider.into(),
                    operation: operation.into(),
                    status,
                    source: Box::new(other),
                }
            }
        }
    }

    /// The innermost error with any context wrapper removed.
    pub fn root(&self) -> &LlmError {
        match self {
            Self::Contextual { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::Contextual { provider, .. } => Some(provider),
            _ => None,
        }
    }

    pub fn operation(&self) -> Option<&str> {
        match self {
            Self::Contextual { operation, .. } => Some(operation),
            _ => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self.root() {
            Self::AuthenticationError(_) | Self::MissingApiKey(_) => ErrorKind::Authentication,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidInput(_) => ErrorKind::InvalidRequest,
            Self::RateLimitError { .. } => ErrorKind::RateLimit,
            Self::ApiError { code, .. } => match *code {
                401 | 403 => ErrorKind::Authentication,
                404 => ErrorKind::NotFound,
                429 => ErrorKind::RateLimit,
                500..=599 => ErrorKind::Server,
                _ => ErrorKind::InvalidRequest,
            },
            Self::HttpError(_) | Self::ConnectionError(_) => ErrorKind::Network,
            Self::TimeoutError(_) => ErrorKind::DeadlineExceeded,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::ParseError(_) | Self::StreamError(_) => ErrorKind::Decoder,
            Self::ConfigurationError(_) => ErrorKind::Configuration,
            Self::UnsupportedOperation(_) => ErrorKind::Unsupported,
            Self::IoError(_) => ErrorKind::Io,
            Self::InternalError(_) | Self::Contextual { .. } => ErrorKind::Internal,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Contextual { status, source, .. } => status.or_else(|| source.status_code()),
            Self::ApiError { code, .. } => Some(*code),
            Self::RateLimitError { .. } => Some(429),
            _ => None,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self.root() {
            Self::RateLimitError { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Server and network failures are retried by the transport; cancellation,
    /// deadlines, auth and invalid requests never are.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Server | ErrorKind::Network | ErrorKind::RateLimit
        )
    }

    pub fn is_auth_error(&self) -> bool {
        self.kind() == ErrorKind::Authentication
    }

    /// True for decoder errors that only affect a single event, so the stream
    /// may continue past them.
    pub fn is_skippable_decode_error(&self) -> bool {
        matches!(self.root(), Self::ParseError(_))
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::TimeoutError(err.to_string());
        }
        if err.is_connect() {
            return Self::ConnectionError(err.to_string());
        }
        Self::HttpError(err.to_string())
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(err: serde_json::Error) -> Self {
        Self::ParseError(err.to_string())
    }
}

impl From<serde_yaml::Error> for LlmError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::ConfigurationError(format!("invalid YAML: {err}"))
    }
}

impl From<std::io::Error> for LlmError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

/// Parse a `Retry-After` value: delta-seconds or an HTTP-date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<f64>() {
        return Duration::try_from_secs_f64(secs).ok();
    }
    let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = at.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

/// Classify an HTTP failure into the error taxonomy.
///
/// The message carries a short body sample and any request identifiers the
/// provider returned, which is usually enough to correlate with provider logs.
pub fn classify_http_error(
    provider_id: &str,
    status: u16,
    body_text: &str,
    headers: &HeaderMap,
) -> LlmError {
    let id_keys = [
        "x-request-id",
        "request-id",
        "x-openai-request-id",
        "x-goog-request-id",
        "cf-ray",
    ];
    let request_ids: Vec<String> = id_keys
        .iter()
        .filter_map(|k| {
            headers
                .get(*k)
                .and_then(|v| v.to_str().ok())
                .map(|v| format!("{k}={v}"))
        })
        .collect();
    let ids_suffix = if request_ids.is_empty() {
        String::new()
    } else {
        format!(" ids=[{}]", request_ids.join(","))
    };
    let body_sample: String = body_text.chars().take(200).collect();
    let provider_message = extract_error_message(body_text);
    let message = provider_message.clone().unwrap_or_else(|| body_sample.clone());

    match status {
        429 => {
            let retry_after = headers
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            LlmError::RateLimitError {
                message: format!("provider={provider_id} http=429{ids_suffix} {message}"),
                retry_after,
            }
        }
        401 => LlmError::AuthenticationError(format!(
            "provider={provider_id} unauthorized{ids_suffix} {message}"
        )),
        403 => LlmError::AuthenticationError(format!(
            "provider={provider_id} forbidden{ids_suffix} {message}"
        )),
        404 => LlmError::NotFound(format!("provider={provider_id} http=404{ids_suffix} {message}")),
        400 | 413 | 415 | 422 => LlmError::InvalidInput(format!(
            "provider={provider_id} http={status}{ids_suffix} {message}"
        )),
        _ => {
            let details = match serde_json::from_str::<serde_json::Value>(body_text) {
                Ok(json) => serde_json::json!({
                    "status": status,
                    "provider": provider_id,
                    "response": json,
                    "request_ids": request_ids,
                }),
                Err(_) => serde_json::json!({
                    "status": status,
                    "provider": provider_id,
                    "raw": body_sample,
                    "request_ids": request_ids,
                }),
            };
            let message = if message.trim().is_empty() {
                "api error".to_string()
            } else {
                message
            };
            LlmError::api_error_with_details(status, message, details)
        }
    }
}

/// Pull a human-readable message out of the common error envelopes
/// (`{"error": "..."}`, `{"error": {"message": "..."}}`, `{"message": "..."}`).
fn extract_error_message(body: &str) -> Option<String> {
    let json: serde_json::Value = serde_json::from_str(body).ok()?;
    match json.get("error") {
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(obj @ serde_json::Value::Object(_)) => obj
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string),
        _ => json
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn context_wrapper_preserves_kind_and_status() {
        let err = LlmError::api_error(502, "bad gateway").with_context("openai", "chat");
        assert_eq!(err.kind(), ErrorKind::Server);
        assert_eq!(err.status_code(), Some(502));
        assert_eq!(err.provider(), Some("openai"));
        assert_eq!(err.operation(), Some("chat"));
        assert!(err.is_retryable());

        let rewrapped = err.with_context("other", "models");
        assert_eq!(rewrapped.provider(), Some("openai"));
    }

    #[test]
    fn cancellation_and_deadline_are_not_retryable() {
        assert!(!LlmError::Cancelled.is_retryable());
        assert!(!LlmError::TimeoutError("deadline".into()).is_retryable());
        assert!(!LlmError::InvalidInput("bad".into()).is_retryable());
        assert!(LlmError::ConnectionError("reset".into()).is_retryable());
    }

    #[test]
    fn classify_maps_statuses() {
        let headers = HeaderMap::new();
        assert_eq!(
            classify_http_error("x", 401, "", &headers).kind(),
            ErrorKind::Authentication
        );
        assert_eq!(
            classify_http_error("x", 404, r#"{"error":"model 'foo' not found"}"#, &headers).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            classify_http_error("x", 400, "", &headers).kind(),
            ErrorKind::InvalidRequest
        );
        assert_eq!(
            classify_http_error("x", 503, "<html>", &headers).kind(),
            ErrorKind::Server
        );
    }

    #[test]
    fn classify_429_reads_retry_after() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("7"));
        let err = classify_http_error("anthropic", 429, "{}", &headers);
        assert_eq!(err.kind(), ErrorKind::RateLimit);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
    }

    #[test]
    fn classify_extracts_nested_message() {
        let headers = HeaderMap::new();
        let err = classify_http_error(
            "openai",
            500,
            r#"{"error":{"message":"upstream exploded","type":"server_error"}}"#,
            &headers,
        );
        match err {
            LlmError::ApiError { code, message, .. } => {
                assert_eq!(code, 500);
                assert_eq!(message, "upstream exploded");
            }
            other => panic!("unexpected error variant: {other:?}"),
        }
    }

    #[test]
    fn retry_after_accepts_http_date_in_the_past() {
        let d = parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT").unwrap();
        assert_eq!(d, Duration::ZERO);
        assert!(parse_retry_after("soon").is_none());
        assert!(parse_retry_after("1e300").is_none());
        assert!(parse_retry_after("-1").is_none());
        assert!(parse_retry_after("NaN").is_none());
    }

    #[test]
    fn from_serde_json_error_is_parse_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let llm_err: LlmError = json_err.into();
        assert!(matches!(llm_err, LlmError::ParseError(_)));
        assert!(llm_err.is_skippable_decode_error());
    }
}
