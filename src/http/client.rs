//! Retrying HTTP transport
//!
//! One `HttpClient` per provider. Request bodies are held as `Bytes` so each
//! attempt sends a fresh copy; a failed attempt never consumes the body of the
//! next one. Backoff sleeps observe the caller's cancellation and deadline.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Method, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::config::HttpConfig;
use super::headers::HttpHeaderBuilder;
use super::interceptor::{HttpInterceptor, HttpRequestContext};
use super::metrics::{HttpMetrics, HttpMetricsSnapshot};
use crate::context::RequestContext;
use crate::error::{LlmError, classify_http_error};

/// A re-sendable request description.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub stream: bool,
    /// Model the request targets; lets interceptors key per-model state.
    pub model: Option<String>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
            stream: false,
            model: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::DELETE, url)
    }

    /// POST with a JSON body serialized once up front.
    pub fn post_json<T: Serialize + ?Sized>(url: impl Into<String>, body: &T) -> Result<Self, LlmError> {
        let bytes = serde_json::to_vec(body)?;
        let mut req = Self::new(Method::POST, url).with_body(bytes);
        req.headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        Ok(req)
    }

    /// POST with an `application/x-www-form-urlencoded` body.
    pub fn post_form(url: impl Into<String>, fields: &[(&str, &str)]) -> Self {
        let body = fields
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let mut req = Self::new(Method::POST, url).with_body(body);
        req.headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        req.headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        req
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    pub fn for_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

pub struct HttpClient {
    provider_id: String,
    client: reqwest::Client,
    config: HttpConfig,
    interceptors: Vec<Arc<dyn HttpInterceptor>>,
    metrics: Arc<HttpMetrics>,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("provider_id", &self.provider_id)
            .field("interceptors", &self.interceptors.len())
            .finish_non_exhaustive()
    }
}

/// Build the pooled reqwest client for a config.
pub fn build_reqwest_client(config: &HttpConfig) -> Result<reqwest::Client, LlmError> {
    let default_headers = HttpHeaderBuilder::new()
        .with_custom_headers(&config.default_headers)?
        .build();
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(config.effective_idle_per_host())
        .pool_idle_timeout(config.idle_timeout)
        // reqwest's connect timeout spans TCP connect plus the TLS handshake.
        .connect_timeout(config.connect_timeout + config.tls_handshake_timeout)
        .user_agent(config.user_agent.clone())
        .default_headers(default_headers);
    if let Some(timeout) = config.read_timeout {
        builder = builder.read_timeout(timeout);
    }
    if !config.proxy_from_env {
        builder = builder.no_proxy();
    }
    if !config.http2 {
        builder = builder.http1_only();
    }
    builder
        .build()
        .map_err(|e| LlmError::ConfigurationError(format!("failed to build HTTP client: {e}")))
}

impl HttpClient {
    pub fn new(provider_id: impl Into<String>, config: HttpConfig) -> Result<Self, LlmError> {
        let client = build_reqwest_client(&config)?;
        Ok(Self {
            provider_id: provider_id.into(),
            client,
            config,
            interceptors: Vec::new(),
            metrics: Arc::new(HttpMetrics::new()),
        })
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn HttpInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn add_interceptor(&mut self, interceptor: Arc<dyn HttpInterceptor>) {
        self.interceptors.push(interceptor);
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    pub fn interceptors(&self) -> &[Arc<dyn HttpInterceptor>] {
        &self.interceptors
    }

    pub fn metrics(&self) -> HttpMetricsSnapshot {
        self.metrics.snapshot()
    }

    fn request_context(&self, req: &HttpRequest, attempt: u32) -> HttpRequestContext {
        HttpRequestContext {
            provider_id: self.provider_id.clone(),
            method: req.method.clone(),
            url: req.url.clone(),
            stream: req.stream,
            attempt,
            model: req.model.clone(),
        }
    }

    /// Context describing `req` for stream-event interceptors.
    pub fn stream_context(&self, req: &HttpRequest) -> HttpRequestContext {
        self.request_context(req, 0)
    }

    /// Send with retries. Only successful (2xx/3xx) responses are returned;
    /// anything else is classified into an `LlmError`.
    pub async fn send(&self, ctx: &RequestContext, req: &HttpRequest) -> Result<Response, LlmError> {
        let policy = &self.config.retry;
        let mut attempt: u32 = 0;
        loop {
            ctx.check()?;
            let started = Instant::now();
            let result = self.send_once(ctx, req, attempt).await;
            let latency = started.elapsed();
            match result {
                Ok(resp) => {
                    self.metrics
                        .record(Some(resp.status().as_u16()), true, latency);
                    return Ok(resp);
                }
                Err(err) => {
                    self.metrics.record(err.status_code(), false, latency);
                    let hctx = self.request_context(req, attempt);
                    for it in &self.interceptors {
                        it.on_error(&hctx, &err);
                    }
                    if attempt >= policy.max_attempts || !policy.should_retry(&err) {
                        return Err(err);
                    }
                    attempt += 1;
                    let delay = policy.delay_for(i64::from(attempt), &err);
                    self.metrics.record_retry();
                    tracing::warn!(
                        target: "infergate::http",
                        provider = %self.provider_id,
                        url = %req.url,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        err = %err,
                        "retrying request"
                    );
                    ctx.sleep(delay).await?;
                }
            }
        }
    }

    async fn send_once(
        &self,
        ctx: &RequestContext,
        req: &HttpRequest,
        attempt: u32,
    ) -> Result<Response, LlmError> {
        let hctx = self.request_context(req, attempt);
        let mut builder = self
            .client
            .request(req.method.clone(), &req.url)
            .headers(req.headers.clone());
        if let Some(body) = &req.body {
            builder = builder.body(body.clone());
        }
        if !req.stream
            && let Some(timeout) = self.config.request_timeout
        {
            builder = builder.timeout(timeout);
        }
        for it in &self.interceptors {
            builder = it.on_before_send(&hctx, builder, req.body.as_deref(), &req.headers)?;
        }

        let send = async { builder.send().await.map_err(LlmError::from) };
        let response = match self.config.request_timeout {
            // Streams may run past the request timeout, but their headers may not.
            Some(limit) if req.stream => {
                ctx.run(async {
                    tokio::time::timeout(limit, send).await.unwrap_or_else(|_| {
                        Err(LlmError::TimeoutError(format!(
                            "no response headers from {} within {limit:?}",
                            self.provider_id
                        )))
                    })
                })
                .await?
            }
            _ => ctx.run(send).await?,
        };

        for it in &self.interceptors {
            // Dropping the response here closes its body.
            it.on_response(&hctx, &response)?;
        }

        let status = response.status();
        if status.is_success() || status.is_redirection() {
            return Ok(response);
        }
        let headers = response.headers().clone();
        let body = ctx
            .run(async { response.text().await.map_err(LlmError::from) })
            .await
            .unwrap_or_default();
        Err(classify_http_error(
            &self.provider_id,
            status.as_u16(),
            &body,
            &headers,
        ))
    }

    /// Send and decode a JSON response body.
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        ctx: &RequestContext,
        req: &HttpRequest,
    ) -> Result<T, LlmError> {
        let response = self.send(ctx, req).await?;
        let bytes = ctx
            .run(async { response.bytes().await.map_err(LlmError::from) })
            .await?;
        serde_json::from_slice(&bytes).map_err(|e| {
            LlmError::ParseError(format!("{} returned malformed JSON: {e}", self.provider_id))
        })
    }

    /// Send a single attempt without retry or status classification.
    /// Used by health checks and OAuth token polling, which interpret raw
    /// statuses themselves.
    pub async fn send_unchecked(&self, ctx: &RequestContext, req: &HttpRequest) -> Result<Response, LlmError> {
        let hctx = self.request_context(req, 0);
        let mut builder = self
            .client
            .request(req.method.clone(), &req.url)
            .headers(req.headers.clone());
        if let Some(body) = &req.body {
            builder = builder.body(body.clone());
        }
        if let Some(timeout) = self.config.request_timeout {
            builder = builder.timeout(timeout);
        }
        for it in &self.interceptors {
            builder = it.on_before_send(&hctx, builder, req.body.as_deref(), &req.headers)?;
        }
        let started = Instant::now();
        let result = ctx
            .run(async { builder.send().await.map_err(LlmError::from) })
            .await;
        match &result {
            Ok(r) => self
                .metrics
                .record(Some(r.status().as_u16()), r.status().is_success(), started.elapsed()),
            Err(_) => self.metrics.record(None, false, started.elapsed()),
        }
        result
    }
}
