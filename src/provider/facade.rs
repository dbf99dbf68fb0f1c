//! Provider facade
//!
//! [`ProviderClient`] forwards to one adapter, consults its rate-limit
//! bookkeeper before sending, and keeps per-provider counters.
//! [`Gateway`] holds one client per configured provider.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use super::factory::ProviderFactory;
use crate::config::AppConfig;
use crate::context::RequestContext;
use crate::error::LlmError;
use crate::providers::LlmProvider;
use crate::streaming::{ChatStream, StreamOutcome};
use crate::types::{GenerateOptions, HealthStatus, ModelInfo, RunningModel};

/// Point-in-time copy of [`ProviderMetrics`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderMetricsSnapshot {
    pub requests: u64,
    pub successes: u64,
    pub errors: u64,
    pub total_latency: Duration,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub last_error: Option<String>,
    pub last_request_at: Option<DateTime<Utc>>,
}

impl ProviderMetricsSnapshot {
    pub fn mean_latency(&self) -> Option<Duration> {
        let finished = self.successes + self.errors;
        if finished == 0 {
            return None;
        }
        let n = u32::try_from(finished).unwrap_or(u32::MAX);
        Some(self.total_latency / n)
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

#[derive(Debug, Default)]
struct Details {
    last_error: Option<String>,
    last_request_at: Option<DateTime<Utc>>,
}

/// Counters are atomics; `details` and the snapshot/reset pair go through the lock.
#[derive(Debug, Default)]
pub struct ProviderMetrics {
    requests: AtomicU64,
    successes: AtomicU64,
    errors: AtomicU64,
    latency_micros: AtomicU64,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
    details: RwLock<Details>,
}

impl ProviderMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_start(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let mut d = match self.details.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        d.last_request_at = Some(Utc::now());
    }

    fn record_latency(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.latency_micros.fetch_add(micros, Ordering::Relaxed);
    }

    fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self, message: String) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        let mut d = match self.details.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        d.last_error = Some(message);
    }

    fn record_tokens(&self, prompt: u32, completion: u32) {
        self.prompt_tokens.fetch_add(u64::from(prompt), Ordering::Relaxed);
        self.completion_tokens
            .fetch_add(u64::from(completion), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProviderMetricsSnapshot {
        let d = match self.details.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        ProviderMetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            total_latency: Duration::from_micros(self.latency_micros.load(Ordering::Relaxed)),
            prompt_tokens: self.prompt_tokens.load(Ordering::Relaxed),
            completion_tokens: self.completion_tokens.load(Ordering::Relaxed),
            last_error: d.last_error.clone(),
            last_request_at: d.last_request_at,
        }
    }

    pub fn reset(&self) {
        let mut d = match self.details.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for counter in [
            &self.requests,
            &self.successes,
            &self.errors,
            &self.latency_micros,
            &self.prompt_tokens,
            &self.completion_tokens,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        *d = Details::default();
    }
}

/// Uniform entry point for one adapter.
#[derive(Clone)]
pub struct ProviderClient {
    provider: Arc<dyn LlmProvider>,
    metrics: Arc<ProviderMetrics>,
}

impl std::fmt::Debug for ProviderClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderClient")
            .field("provider", &self.provider.name())
            .field("metrics", &self.metrics.snapshot())
            .finish()
    }
}

impl ProviderClient {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            metrics: Arc::new(ProviderMetrics::new()),
        }
    }

    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.provider
    }

    pub fn metrics(&self) -> ProviderMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    async fn tracked<T, F>(&self, op: &'static str, fut: F) -> Result<T, LlmError>
    where
        F: Future<Output = Result<T, LlmError>>,
    {
        self.metrics.record_start();
        let started = Instant::now();
        let result = fut.await;
        self.metrics.record_latency(started.elapsed());
        match &result {
            Ok(_) => self.metrics.record_success(),
            Err(e) => {
                tracing::debug!(
                    target: "infergate::provider",
                    provider = self.provider.name(),
                    op,
                    error = %e,
                    "provider call failed"
                );
                self.metrics.record_error(e.to_string());
            }
        }
        result
    }

    /// Stream a completion. Waits out the rate-limit bookkeeper first; the
    /// request counts as finished when the stream ends.
    pub async fn generate_chat_completion(
        &self,
        ctx: &RequestContext,
        options: GenerateOptions,
    ) -> Result<ChatStream, LlmError> {
        let model = options.resolve_model(&self.provider.default_model())?;
        self.provider
            .rate_limits()
            .check_and_wait(ctx, &model, options.estimated_tokens())
            .await?;

        self.metrics.record_start();
        let started = Instant::now();
        match self.provider.generate_chat_completion(ctx, options).await {
            Ok(stream) => {
                let metrics = self.metrics.clone();
                Ok(stream.add_completion_hook(move |outcome: StreamOutcome| {
                    metrics.record_latency(started.elapsed());
                    if let Some(usage) = outcome.usage {
                        metrics.record_tokens(usage.prompt_tokens, usage.completion_tokens);
                    }
                    match outcome.error {
                        Some(kind) => metrics.record_error(format!("stream ended with {kind:?} error")),
                        None => metrics.record_success(),
                    }
                }))
            }
            Err(e) => {
                self.metrics.record_latency(started.elapsed());
                self.metrics.record_error(e.to_string());
                Err(e)
            }
        }
    }

    pub async fn get_models(&self, ctx: &RequestContext) -> Result<Vec<ModelInfo>, LlmError> {
        self.tracked("get_models", self.provider.get_models(ctx)).await
    }

    pub async fn get_running_models(
        &self,
        ctx: &RequestContext,
    ) -> Result<Vec<RunningModel>, LlmError> {
        self.tracked("get_running_models", self.provider.get_running_models(ctx))
            .await
    }

    pub async fn generate_embeddings(
        &self,
        ctx: &RequestContext,
        model: &str,
        text: &str,
    ) -> Result<Vec<f32>, LlmError> {
        self.provider
            .rate_limits()
            .check_and_wait(ctx, model, crate::utils::estimate_tokens(text.len()))
            .await?;
        self.tracked("embeddings", self.provider.generate_embeddings(ctx, model, text))
            .await
    }

    pub async fn health_check(&self, ctx: &RequestContext) -> Result<HealthStatus, LlmError> {
        self.tracked("health_check", self.provider.health_check(ctx)).await
    }

    pub fn can_make_request(&self, model: &str, estimated_tokens: u64) -> bool {
        self.provider
            .rate_limits()
            .can_make_request(model, estimated_tokens)
    }
}

/// One [`ProviderClient`] per configured provider.
#[derive(Debug, Default)]
pub struct Gateway {
    clients: BTreeMap<String, ProviderClient>,
}

impl Gateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(factory: &ProviderFactory, app: &AppConfig) -> Result<Self, LlmError> {
        let clients = factory
            .create_all(app)?
            .into_iter()
            .map(|(key, provider)| (key, ProviderClient::new(provider)))
            .collect();
        Ok(Self { clients })
    }

    pub fn insert(&mut self, key: impl Into<String>, provider: Arc<dyn LlmProvider>) {
        self.clients.insert(key.into(), ProviderClient::new(provider));
    }

    pub fn client(&self, key: &str) -> Result<&ProviderClient, LlmError> {
        self.clients
            .get(key)
            .ok_or_else(|| LlmError::NotFound(format!("no provider configured as '{key}'")))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.clients.keys().map(String::as_str)
    }

    pub fn metrics(&self) -> BTreeMap<String, ProviderMetricsSnapshot> {
        self.clients
            .iter()
            .map(|(k, c)| (k.clone(), c.metrics()))
            .collect()
    }
}

static_assertions::assert_impl_all!(ProviderClient: Send, Sync, Clone);
static_assertions::assert_impl_all!(Gateway: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_and_reset() {
        let m = ProviderMetrics::new();
        m.record_start();
        m.record_latency(Duration::from_millis(40));
        m.record_success();
        m.record_start();
        m.record_latency(Duration::from_millis(20));
        m.record_error("boom".into());
        m.record_tokens(5, 10);

        let s = m.snapshot();
        assert_eq!(s.requests, 2);
        assert_eq!(s.successes, 1);
        assert_eq!(s.errors, 1);
        assert_eq!(s.total_tokens(), 15);
        assert_eq!(s.mean_latency(), Some(Duration::from_millis(30)));
        assert_eq!(s.last_error.as_deref(), Some("boom"));
        assert!(s.last_request_at.is_some());

        m.reset();
        assert_eq!(m.snapshot(), ProviderMetricsSnapshot::default());
    }

    #[test]
    fn unknown_gateway_key_is_not_found() {
        let gw = Gateway::new();
        assert!(matches!(gw.client("nope"), Err(LlmError::NotFound(_))));
    }
}
