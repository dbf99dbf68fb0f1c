//! HTTP transport configuration

use std::collections::HashMap;
use std::time::Duration;

use super::retry::RetryPolicy;

/// Connection pool and timeout settings for one provider's transport.
///
/// reqwest pools per host, so `max_idle_total` caps the per-host idle limit.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub max_idle_total: Option<usize>,
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
    pub tls_handshake_timeout: Duration,
    /// Deadline for a whole non-streaming request. For streams it bounds the
    /// wait for response headers; the body is bounded by `read_timeout`.
    pub request_timeout: Option<Duration>,
    /// Longest silence allowed between two reads of a response body.
    pub read_timeout: Option<Duration>,
    pub connect_timeout: Duration,
    pub user_agent: String,
    pub default_headers: HashMap<String, String>,
    pub proxy_from_env: bool,
    pub http2: bool,
    pub retry: RetryPolicy,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            max_idle_total: Some(100),
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            tls_handshake_timeout: Duration::from_secs(10),
            request_timeout: Some(Duration::from_secs(120)),
            read_timeout: Some(Duration::from_secs(60)),
            connect_timeout: Duration::from_secs(10),
            user_agent: format!("infergate/{}", env!("CARGO_PKG_VERSION")),
            default_headers: HashMap::new(),
            proxy_from_env: true,
            http2: true,
            retry: RetryPolicy::default(),
        }
    }
}

impl HttpConfig {
    /// Larger pool for callers that fan out many concurrent requests.
    pub fn high_concurrency() -> Self {
        Self {
            max_idle_total: Some(500),
            max_idle_per_host: 100,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Idle connections kept for one host.
    pub fn effective_idle_per_host(&self) -> usize {
        self.max_idle_total
            .map_or(self.max_idle_per_host, |total| total.min(self.max_idle_per_host))
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = ua.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.insert(name.into(), value.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn without_proxy(mut self) -> Self {
        self.proxy_from_env = false;
        self
    }
}
