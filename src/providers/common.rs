//! Shared adapter plumbing.
//!
//! `ProviderCore` owns what every adapter needs: the per-provider HTTP
//! transport, the credential source, the rate-limit bookkeeper, the decoder
//! factory and the connectivity and model-list caches.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use lru::LruCache;
use reqwest::Response;
use reqwest::header::HeaderMap;
use secrecy::SecretString;

use crate::auth::{
    ApiKeyRing, CredentialManager, CredentialStore, OAuthEndpoints, StaticTokenProvider,
    TokenProvider,
};
use crate::config::{AuthMode, ProviderConfig, ProviderType};
use crate::context::RequestContext;
use crate::error::LlmError;
use crate::http::{
    HttpClient, HttpConfig, HttpHeaderBuilder, HttpInterceptor, HttpRequest, HttpRequestContext,
    LoggingInterceptor,
};
use crate::ratelimit::{RateLimitParser, RateLimitTracker};
use crate::streaming::{ChatStream, DecoderFactory, StreamFormat, StreamTranslator};
use crate::types::{HealthStatus, ModelInfo};

/// Connectivity results are reused for this long.
pub const HEALTH_CACHE_TTL: Duration = Duration::from_secs(30);
/// Model catalogs are reused for this long.
pub const MODELS_CACHE_TTL: Duration = Duration::from_secs(300);
const MODELS_CACHE_CAPACITY: usize = 8;

/// How a credential is attached to requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    None,
    /// `Authorization: Bearer <token>`
    Bearer,
    /// A named header carrying the raw key, e.g. `x-api-key`.
    Header(&'static str),
}

/// Feeds every response's headers to the rate-limit bookkeeper before the
/// body reaches a translator.
pub struct RateLimitInterceptor {
    tracker: Arc<RateLimitTracker>,
}

impl RateLimitInterceptor {
    pub fn new(tracker: Arc<RateLimitTracker>) -> Self {
        Self { tracker }
    }
}

impl HttpInterceptor for RateLimitInterceptor {
    fn on_response(
        &self,
        ctx: &HttpRequestContext,
        response: &reqwest::Response,
    ) -> Result<(), LlmError> {
        let model = ctx.model.as_deref().unwrap_or_default();
        let updated = self.tracker.update_from_headers(model, response.headers());
        if response.status().as_u16() == 429
            && updated.and_then(|i| i.retry_after).is_none()
        {
            let wait = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(crate::error::parse_retry_after)
                .unwrap_or(Duration::from_secs(1));
            self.tracker.record_retry_after(model, wait);
        }
        Ok(())
    }
}

/// Build the credential source a provider section asks for.
pub fn token_provider_for(
    config: &ProviderConfig,
    store: Option<Arc<CredentialStore>>,
) -> Result<Option<Arc<dyn TokenProvider>>, LlmError> {
    match config.effective_auth_mode() {
        AuthMode::None => {
            // Fall back to the provider's conventional environment variable.
            match config.provider_type.default_api_key_env() {
                Some(var) => Ok(ApiKeyRing::from_env(var)
                    .ok()
                    .map(|r| Arc::new(r) as Arc<dyn TokenProvider>)),
                None => Ok(None),
            }
        }
        AuthMode::ApiKey | AuthMode::ApiKeyList => {
            let ring = ApiKeyRing::from_config(config)?;
            if ring.len() == 1 {
                tracing::debug!(target: "infergate::auth", provider = %config.name, "using a single API key");
            }
            Ok(Some(Arc::new(ring)))
        }
        AuthMode::OAuth => {
            let Some(first) = config.oauth_credentials.first() else {
                return Err(LlmError::ConfigurationError(format!(
                    "provider '{}' uses oauth but has no credentials",
                    config.name
                )));
            };
            let endpoints =
                OAuthEndpoints::for_provider(config, &first.client_id, first.client_secret.clone())?;
            let mut manager = CredentialManager::new(
                config.name.clone(),
                config.provider_type.clone(),
                endpoints,
                config.oauth_credentials.clone(),
            )?;
            if let Some(store) = store {
                manager = manager.with_store(store);
            }
            Ok(Some(Arc::new(manager)))
        }
    }
}

/// Transport settings for a provider section: `timeout_secs`,
/// `read_timeout_secs` and `max_retries` options override the defaults.
pub fn http_config_for(config: &ProviderConfig) -> HttpConfig {
    let mut http_config = HttpConfig::default();
    if let Some(timeout) = config.timeout() {
        http_config = http_config.with_timeout(timeout);
    }
    if let Some(secs) = config.option_u64("read_timeout_secs") {
        http_config = http_config.with_read_timeout(Duration::from_secs(secs));
    }
    if let Some(attempts) = config.option_u64("max_retries") {
        http_config.retry = http_config
            .retry
            .with_max_attempts(u32::try_from(attempts).unwrap_or(u32::MAX));
    }
    http_config
}

pub struct ProviderCore {
    pub name: String,
    pub provider_type: ProviderType,
    pub base_url: String,
    pub default_model: String,
    pub config: ProviderConfig,
    pub http: HttpClient,
    pub decoders: Arc<DecoderFactory>,
    pub rate_limits: Arc<RateLimitTracker>,
    scheme: AuthScheme,
    store: Option<Arc<CredentialStore>>,
    auth: RwLock<Option<Arc<dyn TokenProvider>>>,
    health: Mutex<Option<(Instant, HealthStatus)>>,
    health_ttl: Duration,
    models: Mutex<LruCache<String, (Instant, Vec<ModelInfo>)>>,
    models_ttl: Duration,
}

impl std::fmt::Debug for ProviderCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderCore")
            .field("name", &self.name)
            .field("provider_type", &self.provider_type)
            .field("base_url", &self.base_url)
            .field("scheme", &self.scheme)
            .finish_non_exhaustive()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

impl ProviderCore {
    pub fn new(
        config: &ProviderConfig,
        scheme: AuthScheme,
        parser: Arc<dyn RateLimitParser>,
        store: Option<Arc<CredentialStore>>,
    ) -> Result<Self, LlmError> {
        config.validate()?;
        let name = if config.name.is_empty() {
            config.provider_type.to_string()
        } else {
            config.name.clone()
        };
        let http_config = http_config_for(config);
        let rate_limits = Arc::new(RateLimitTracker::new(name.clone(), parser));
        let http = HttpClient::new(name.clone(), http_config)?
            .with_interceptor(Arc::new(RateLimitInterceptor::new(rate_limits.clone())))
            .with_interceptor(Arc::new(LoggingInterceptor));
        let auth = token_provider_for(config, store.clone())?;
        Ok(Self {
            name,
            provider_type: config.provider_type.clone(),
            base_url: config.base_url_or_default(),
            default_model: config.default_model.clone(),
            config: config.clone(),
            http,
            decoders: Arc::new(DecoderFactory::new()),
            rate_limits,
            scheme,
            store,
            auth: RwLock::new(auth),
            health: Mutex::new(None),
            health_ttl: HEALTH_CACHE_TTL,
            models: Mutex::new(LruCache::new(
                NonZeroUsize::new(MODELS_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            )),
            models_ttl: MODELS_CACHE_TTL,
        })
    }

    /// Replace the HTTP transport, keeping the rate-limit interceptor.
    pub fn with_http_config(mut self, config: HttpConfig) -> Result<Self, LlmError> {
        self.http = HttpClient::new(self.name.clone(), config)?
            .with_interceptor(Arc::new(RateLimitInterceptor::new(self.rate_limits.clone())))
            .with_interceptor(Arc::new(LoggingInterceptor));
        Ok(self)
    }

    pub fn with_decoders(mut self, decoders: Arc<DecoderFactory>) -> Self {
        self.decoders = decoders;
        self
    }

    pub fn with_cache_ttls(mut self, health: Duration, models: Duration) -> Self {
        self.health_ttl = health;
        self.models_ttl = models;
        self
    }

    pub fn scheme(&self) -> AuthScheme {
        self.scheme
    }

    pub fn set_scheme(&mut self, scheme: AuthScheme) {
        self.scheme = scheme;
    }

    pub fn url(&self, path: &str) -> String {
        crate::utils::join_url(&self.base_url, path)
    }

    fn token_provider(&self) -> Option<Arc<dyn TokenProvider>> {
        match self.auth.read() {
            Ok(g) => g.clone(),
            Err(p) => p.into_inner().clone(),
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.token_provider().is_some()
    }

    pub fn set_token_provider(&self, provider: Option<Arc<dyn TokenProvider>>) {
        match self.auth.write() {
            Ok(mut g) => *g = provider,
            Err(p) => *p.into_inner() = provider,
        }
    }

    /// Reload credentials from a provider section.
    pub fn reauthenticate(&self, config: &ProviderConfig) -> Result<(), LlmError> {
        let provider = token_provider_for(config, self.store.clone())?;
        self.set_token_provider(provider);
        lock(&self.health).take();
        lock(&self.models).clear();
        Ok(())
    }

    /// Replace the credential with a fixed key (tests, ad-hoc use).
    pub fn set_static_token(&self, token: impl Into<String>) {
        self.set_token_provider(Some(Arc::new(StaticTokenProvider::new(token))));
    }

    fn auth_headers(&self, token: &SecretString) -> Result<HeaderMap, LlmError> {
        let builder = HttpHeaderBuilder::new();
        let builder = match self.scheme {
            AuthScheme::None => builder,
            AuthScheme::Bearer => builder.with_bearer_auth(token)?,
            AuthScheme::Header(name) => builder.with_custom_auth(name, token)?,
        };
        Ok(builder.build())
    }

    /// Send with credentials attached. A 401/403 lets the credential source
    /// rotate or refresh once; the request is then retried a single time.
    pub async fn send(
        &self,
        ctx: &RequestContext,
        req: &HttpRequest,
        operation: &str,
    ) -> Result<Response, LlmError> {
        self.send_inner(ctx, req)
            .await
            .map_err(|e| e.with_context(self.name.clone(), operation))
    }

    async fn send_inner(&self, ctx: &RequestContext, req: &HttpRequest) -> Result<Response, LlmError> {
        let auth = match self.scheme {
            AuthScheme::None => None,
            _ => self.token_provider(),
        };
        let Some(auth) = auth else {
            return self.http.send(ctx, req).await;
        };

        let token = auth.token(ctx).await?;
        let first = req.clone().with_headers(self.auth_headers(&token)?);
        let (token, result) = match self.http.send(ctx, &first).await {
            Err(err) if err.is_auth_error() => {
                if !auth.on_rejected(ctx, &token).await? {
                    return Err(err);
                }
                tracing::info!(target: "infergate::auth", provider = %self.name, source = auth.kind(), "credential rejected; retrying once with a new one");
                let token = auth.token(ctx).await?;
                let second = req.clone().with_headers(self.auth_headers(&token)?);
                let result = self.http.send(ctx, &second).await;
                (token, result)
            }
            other => (token, other),
        };
        if result.is_ok() {
            auth.on_accepted(&token);
        }
        result
    }

    /// Send and decode a JSON body.
    pub async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        ctx: &RequestContext,
        req: &HttpRequest,
        operation: &str,
    ) -> Result<T, LlmError> {
        let response = self.send(ctx, req, operation).await?;
        let bytes = ctx
            .run(async { response.bytes().await.map_err(LlmError::from) })
            .await
            .map_err(|e| e.with_context(self.name.clone(), operation))?;
        serde_json::from_slice(&bytes).map_err(|e| {
            LlmError::ParseError(format!("malformed {operation} response: {e}"))
                .with_context(self.name.clone(), operation)
        })
    }

    /// Send a streaming request and wrap the response in a `ChatStream`.
    pub async fn open_stream(
        &self,
        ctx: &RequestContext,
        req: HttpRequest,
        fallback: StreamFormat,
        translator: Box<dyn StreamTranslator>,
    ) -> Result<ChatStream, LlmError> {
        let req = req.streaming();
        let response = self.send(ctx, &req, "chat").await?;
        let stream = ChatStream::from_response(
            self.name.clone(),
            response,
            &self.decoders,
            fallback,
            translator,
            ctx.clone(),
        )
        .await
        .map_err(|e| e.with_context(self.name.clone(), "chat"))?;
        Ok(stream.with_interceptors(
            self.http.interceptors().to_vec(),
            self.http.stream_context(&req),
        ))
    }

    /// Try `urls` in order. The first answer whose status `accept` allows
    /// is healthy; 401/403 are authentication failures. Results are cached.
    pub async fn poll_health(
        &self,
        ctx: &RequestContext,
        urls: &[String],
        accept: fn(u16) -> bool,
    ) -> Result<HealthStatus, LlmError> {
        if let Some((at, status)) = lock(&self.health).as_ref()
            && at.elapsed() < self.health_ttl
        {
            return Ok(status.clone());
        }

        let started = Instant::now();
        let mut last_message = None;
        let mut healthy = None;
        for url in urls {
            let mut req = HttpRequest::get(url.clone());
            if self.scheme != AuthScheme::None
                && let Some(auth) = self.token_provider()
            {
                let token = auth.token(ctx).await?;
                req = req.with_headers(self.auth_headers(&token)?);
            }
            match self.http.send_unchecked(ctx, &req).await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if status == 401 || status == 403 {
                        return Err(LlmError::AuthenticationError(format!(
                            "health check {url} answered {status}"
                        ))
                        .with_context(self.name.clone(), "health_check"));
                    }
                    if accept(status) {
                        let version = resp
                            .json::<serde_json::Value>()
                            .await
                            .ok()
                            .and_then(|v| v.get("version").and_then(|s| s.as_str()).map(str::to_string));
                        healthy = Some(version);
                        break;
                    }
                    last_message = Some(format!("{url} answered {status}"));
                }
                Err(LlmError::Cancelled) => return Err(LlmError::Cancelled),
                Err(e) => last_message = Some(format!("{url}: {e}")),
            }
        }

        let latency_ms = started.elapsed().as_millis() as u64;
        let status = match healthy {
            Some(version) => HealthStatus {
                healthy: true,
                latency_ms,
                version,
                message: None,
            },
            None => HealthStatus {
                healthy: false,
                latency_ms,
                version: None,
                message: last_message,
            },
        };
        tracing::debug!(target: "infergate::provider", provider = %self.name, healthy = status.healthy, latency_ms, "health check");
        *lock(&self.health) = Some((Instant::now(), status.clone()));
        Ok(status)
    }

    /// Cached model list for `key`, if still fresh.
    pub fn cached_models(&self, key: &str) -> Option<Vec<ModelInfo>> {
        let mut cache = lock(&self.models);
        match cache.get(key) {
            Some((at, models)) if at.elapsed() < self.models_ttl => Some(models.clone()),
            Some(_) => {
                cache.pop(key);
                None
            }
            None => None,
        }
    }

    pub fn cache_models(&self, key: &str, models: &[ModelInfo]) {
        lock(&self.models).put(key.to_string(), (Instant::now(), models.to_vec()));
    }

    pub fn invalidate_caches(&self) {
        lock(&self.health).take();
        lock(&self.models).clear();
    }
}

/// Accept 2xx and 3xx.
pub fn status_ok(status: u16) -> bool {
    (200..400).contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::GenericRateLimitParser;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn core(server: &MockServer, keys: &[&str]) -> ProviderCore {
        let cfg = ProviderConfig::new(ProviderType::Custom("test".into()))
            .with_base_url(server.uri())
            .with_api_keys(keys.iter().copied());
        ProviderCore::new(&cfg, AuthScheme::Bearer, Arc::new(GenericRateLimitParser), None).unwrap()
    }

    #[tokio::test]
    async fn rejected_key_rotates_and_retries_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/x"))
            .and(header("authorization", "Bearer bad"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/x"))
            .and(header("authorization", "Bearer good"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let core = core(&server, &["bad", "good"]);
        let resp = core
            .send(&RequestContext::new(), &HttpRequest::get(core.url("/x")), "test")
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
    }

    #[tokio::test]
    async fn auth_failure_surfaces_after_one_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .expect(2)
            .mount(&server)
            .await;
        let core = core(&server, &["a", "b", "c"]);
        let err = core
            .send(&RequestContext::new(), &HttpRequest::get(core.url("/x")), "test")
            .await
            .unwrap_err();
        assert!(err.is_auth_error());
        assert_eq!(err.provider(), Some("test"));
        assert_eq!(err.operation(), Some("test"));
    }

    #[tokio::test]
    async fn successes_between_rejections_keep_rotation_alive() {
        let server = MockServer::start().await;
        let core = core(&server, &["a", "b"]);
        let ctx = RequestContext::new();

        // Each key is rejected once, on separate occasions, with successes in between.
        for (rejected, accepted) in [("a", "b"), ("b", "a"), ("a", "b")] {
            server.reset().await;
            Mock::given(method("GET"))
                .and(header("authorization", format!("Bearer {rejected}").as_str()))
                .respond_with(ResponseTemplate::new(401))
                .expect(1)
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(header("authorization", format!("Bearer {accepted}").as_str()))
                .respond_with(ResponseTemplate::new(200))
                .expect(1)
                .mount(&server)
                .await;
            let resp = core
                .send(&ctx, &HttpRequest::get(core.url("/x")), "test")
                .await
                .unwrap();
            assert_eq!(resp.status().as_u16(), 200, "after rejecting {rejected}");
        }
    }

    #[tokio::test]
    async fn health_result_is_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ping"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        let core = core(&server, &["k"]);
        let ctx = RequestContext::new();
        let urls = vec![core.url("/ping")];
        assert!(core.poll_health(&ctx, &urls, status_ok).await.unwrap().healthy);
        assert!(core.poll_health(&ctx, &urls, status_ok).await.unwrap().healthy);
    }

    #[tokio::test]
    async fn rate_limit_headers_update_before_body_is_read() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("retry-after", "30")
                    .set_body_string("{}"),
            )
            .mount(&server)
            .await;
        let core = core(&server, &["k"]);
        let req = HttpRequest::get(core.url("/x")).for_model("m");
        let _resp = core.send(&RequestContext::new(), &req, "test").await.unwrap();
        assert!(!core.rate_limits.can_make_request("m", 0));
    }
}
