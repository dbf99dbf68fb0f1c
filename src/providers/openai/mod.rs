//! OpenAI and OpenAI-compatible back-ends
//!
//! One adapter serves every back-end that speaks the chat-completions
//! dialect. The flavor only decides path prefix, default model and which
//! rate-limit header syntax to read.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use super::LlmProvider;
use super::common::{AuthScheme, ProviderCore, status_ok};
use crate::auth::CredentialStore;
use crate::config::{ProviderConfig, ProviderType};
use crate::context::RequestContext;
use crate::error::LlmError;
use crate::http::{HttpHeaderBuilder, HttpRequest};
use crate::ratelimit::{
    CerebrasRateLimitParser, OpenAiRateLimitParser, OpenRouterRateLimitParser, RateLimitParser,
    RateLimitTracker,
};
use crate::streaming::{ChatStream, StreamFormat};
use crate::types::{
    ChatMessage, GenerateOptions, HealthStatus, ModelCapability, ModelInfo, ToolFormat,
};

pub mod stream;
pub mod wire;

pub use stream::OpenAiTranslator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenAiFlavor {
    OpenAi,
    Qwen,
    Cerebras,
    OpenRouter,
    /// Any other server exposing `/v1/chat/completions`.
    Compatible,
}

impl OpenAiFlavor {
    pub fn for_type(provider_type: &ProviderType) -> Self {
        match provider_type {
            ProviderType::OpenAi => Self::OpenAi,
            ProviderType::Qwen => Self::Qwen,
            ProviderType::Cerebras => Self::Cerebras,
            ProviderType::OpenRouter => Self::OpenRouter,
            _ => Self::Compatible,
        }
    }

    pub fn api_prefix(&self) -> &'static str {
        match self {
            Self::OpenRouter => "/api/v1",
            _ => "/v1",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            Self::OpenAi => "gpt-4o-mini",
            Self::Qwen => "qwen-plus",
            Self::Cerebras => "llama3.1-8b",
            Self::OpenRouter => "openai/gpt-4o-mini",
            Self::Compatible => "",
        }
    }

    fn rate_limit_parser(&self) -> Arc<dyn RateLimitParser> {
        match self {
            Self::Cerebras => Arc::new(CerebrasRateLimitParser),
            Self::OpenRouter => Arc::new(OpenRouterRateLimitParser),
            _ => Arc::new(OpenAiRateLimitParser),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<WireModel>,
}

#[derive(Debug, Deserialize)]
struct WireModel {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    owned_by: Option<String>,
    #[serde(default)]
    context_length: Option<u32>,
    #[serde(default)]
    created: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f32>,
}

/// Capabilities guessed from a model id when the catalog carries none.
fn infer_capabilities(id: &str) -> Vec<ModelCapability> {
    let id = id.to_ascii_lowercase();
    if id.contains("embed") {
        return vec![ModelCapability::Embeddings];
    }
    let mut caps = vec![ModelCapability::Chat, ModelCapability::Tools];
    if id.contains("vision") || id.contains("gpt-4o") || id.contains("-vl") {
        caps.push(ModelCapability::Vision);
    }
    caps
}

pub struct OpenAiProvider {
    core: ProviderCore,
    flavor: OpenAiFlavor,
    include_usage: bool,
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("core", &self.core)
            .field("flavor", &self.flavor)
            .finish()
    }
}

impl OpenAiProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self, LlmError> {
        Self::with_store(config, None)
    }

    pub fn with_store(
        config: &ProviderConfig,
        store: Option<Arc<CredentialStore>>,
    ) -> Result<Self, LlmError> {
        let flavor = OpenAiFlavor::for_type(&config.provider_type);
        let core = ProviderCore::new(config, AuthScheme::Bearer, flavor.rate_limit_parser(), store)?;
        Ok(Self {
            include_usage: config.option_bool("stream_usage").unwrap_or(true),
            core,
            flavor,
        })
    }

    /// Build on an existing core (used by Ollama's `/v1` dialect).
    pub fn from_core(core: ProviderCore, flavor: OpenAiFlavor) -> Self {
        let include_usage = core.config.option_bool("stream_usage").unwrap_or(true);
        Self {
            core,
            flavor,
            include_usage,
        }
    }

    pub fn core(&self) -> &ProviderCore {
        &self.core
    }

    pub fn flavor(&self) -> OpenAiFlavor {
        self.flavor
    }

    fn path(&self, tail: &str) -> String {
        self.core
            .url(&format!("{}/{}", self.flavor.api_prefix(), tail))
    }

    fn extra_headers(&self) -> Result<HttpHeaderBuilder, LlmError> {
        let mut builder = HttpHeaderBuilder::new().with_json_content_type();
        if self.flavor == OpenAiFlavor::OpenRouter {
            if let Some(referer) = self.core.config.option_str("http_referer") {
                builder = builder.with_header("HTTP-Referer", referer)?;
            }
            if let Some(title) = self.core.config.option_str("app_title") {
                builder = builder.with_header("X-Title", title)?;
            }
        }
        Ok(builder)
    }

    /// The streaming request for `options`, exposed for request inspection.
    pub fn chat_request(&self, options: &GenerateOptions) -> Result<(String, HttpRequest), LlmError> {
        options.validate()?;
        let model = options.resolve_model(&self.default_model())?;
        let body = wire::build_chat_request(&model, options, self.include_usage);
        let headers = self
            .extra_headers()?
            .with_accept("text/event-stream")
            .build();
        let req = HttpRequest::post_json(self.path("chat/completions"), &body)?
            .with_headers(headers)
            .for_model(model.clone());
        Ok((model, req))
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn provider_type(&self) -> ProviderType {
        self.core.provider_type.clone()
    }

    fn is_authenticated(&self) -> bool {
        self.core.has_credentials()
    }

    async fn authenticate(&self, config: &ProviderConfig) -> Result<(), LlmError> {
        self.core.reauthenticate(config)
    }

    fn default_model(&self) -> String {
        if self.core.default_model.is_empty() {
            self.flavor.default_model().to_string()
        } else {
            self.core.default_model.clone()
        }
    }

    async fn get_models(&self, ctx: &RequestContext) -> Result<Vec<ModelInfo>, LlmError> {
        if let Some(models) = self.core.cached_models("models") {
            return Ok(models);
        }
        let req = HttpRequest::get(self.path("models"));
        let list: ModelList = self.core.send_json(ctx, &req, "get_models").await?;
        let models: Vec<ModelInfo> = list
            .data
            .into_iter()
            .map(|m| {
                let mut info = ModelInfo::new(m.id.clone(), self.core.name.clone());
                info.capabilities = infer_capabilities(&m.id);
                info.context_length = m.context_length;
                info.family = m.owned_by;
                if let Some(name) = m.name {
                    info.name = name;
                }
                info.modified_at = m
                    .created
                    .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0));
                info
            })
            .collect();
        tracing::debug!(target: "infergate::provider", provider = %self.core.name, count = models.len(), "fetched model list");
        self.core.cache_models("models", &models);
        Ok(models)
    }

    async fn generate_chat_completion(
        &self,
        ctx: &RequestContext,
        options: GenerateOptions,
    ) -> Result<ChatStream, LlmError> {
        let (model, req) = self
            .chat_request(&options)
            .map_err(|e| e.with_context(self.core.name.clone(), "chat"))?;
        self.core
            .open_stream(ctx, req, StreamFormat::Sse, Box::new(OpenAiTranslator::new(model)))
            .await
    }

    async fn generate_embeddings(
        &self,
        ctx: &RequestContext,
        model: &str,
        text: &str,
    ) -> Result<Vec<f32>, LlmError> {
        let req = HttpRequest::post_json(self.path("embeddings"), &json!({"model": model, "input": text}))?
            .for_model(model);
        let resp: EmbeddingResponse = self.core.send_json(ctx, &req, "embeddings").await?;
        resp.data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| {
                LlmError::ParseError("embedding response carried no vectors".into())
                    .with_context(self.core.name.clone(), "embeddings")
            })
    }

    async fn health_check(&self, ctx: &RequestContext) -> Result<HealthStatus, LlmError> {
        self.core
            .poll_health(ctx, &[self.path("models")], status_ok)
            .await
    }

    fn tool_format(&self) -> ToolFormat {
        ToolFormat::OpenAi
    }

    fn encode_messages(&self, messages: &[ChatMessage]) -> Result<Value, LlmError> {
        Ok(wire::encode_messages(messages))
    }

    fn decode_messages(&self, wire: &Value) -> Result<Vec<ChatMessage>, LlmError> {
        wire::decode_messages(wire)
    }

    fn rate_limits(&self) -> Arc<RateLimitTracker> {
        self.core.rate_limits.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Tool, Usage};
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer, provider_type: ProviderType) -> OpenAiProvider {
        let cfg = ProviderConfig::new(provider_type)
            .with_name("oa")
            .with_base_url(server.uri())
            .with_api_key("sk-test");
        OpenAiProvider::new(&cfg).unwrap()
    }

    fn sse(frames: &[&str]) -> String {
        frames.iter().map(|f| format!("data: {f}\n\n")).collect()
    }

    #[tokio::test]
    async fn streams_content_and_usage() {
        let server = MockServer::start().await;
        let body = sse(&[
            r#"{"id":"r1","model":"gpt-4o-mini","choices":[{"delta":{"content":"Hel"}}]}"#,
            r#"{"id":"r1","choices":[{"delta":{"content":"lo"},"finish_reason":"stop"}]}"#,
            r#"{"id":"r1","choices":[],"usage":{"prompt_tokens":4,"completion_tokens":2,"total_tokens":6}}"#,
            "[DONE]",
        ]);
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({"stream": true, "model": "gpt-4o-mini"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .insert_header("x-ratelimit-remaining-requests", "0")
                    .insert_header("x-ratelimit-limit-requests", "100")
                    .insert_header("x-ratelimit-reset-requests", "20s")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let p = provider(&server, ProviderType::OpenAi);
        let opts = GenerateOptions::new("").message(ChatMessage::user("hi"));
        let stream = p
            .generate_chat_completion(&RequestContext::new(), opts)
            .await
            .unwrap();
        // Headers are recorded before any chunk is read.
        assert!(!p.rate_limits().can_make_request("gpt-4o-mini", 0));
        let resp = stream.collect().await.unwrap();
        assert_eq!(resp.content, "Hello");
        assert_eq!(resp.finish_reason, "stop");
        assert_eq!(resp.usage, Some(Usage::new(4, 2)));
    }

    #[tokio::test]
    async fn tool_calls_collect_into_one_record() {
        let server = MockServer::start().await;
        let body = sse(&[
            r#"{"id":"r","choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_abc","function":{"name":"get_weather","arguments":""}}]}}]}"#,
            r#"{"id":"r","choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"loc"}}]}}]}"#,
            r#"{"id":"r","choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"ation\":"}}]}}]}"#,
            r#"{"id":"r","choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"SF\"}"}}]}}]}"#,
            r#"{"id":"r","choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
            "[DONE]",
        ]);
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;
        let p = provider(&server, ProviderType::OpenAi);
        let opts = GenerateOptions::new("gpt-4o")
            .message(ChatMessage::user("weather?"))
            .tool(Tool::function("get_weather", "", json!({"type": "object"})));
        let resp = p
            .generate_chat_completion(&RequestContext::new(), opts)
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].arguments, r#"{"location":"SF"}"#);
        assert_eq!(resp.finish_reason, "tool_calls");
    }

    #[tokio::test]
    async fn openrouter_uses_api_prefix() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": "openai/gpt-4o", "context_length": 128000}]
            })))
            .expect(1)
            .mount(&server)
            .await;
        let p = provider(&server, ProviderType::OpenRouter);
        let ctx = RequestContext::new();
        let models = p.get_models(&ctx).await.unwrap();
        assert_eq!(models[0].context_length, Some(128000));
        assert!(models[0].supports(ModelCapability::Vision));
        // Served from cache the second time.
        assert_eq!(p.get_models(&ctx).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unauthorized_health_check_is_an_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        let p = provider(&server, ProviderType::Cerebras);
        let err = p.health_check(&RequestContext::new()).await.unwrap_err();
        assert!(err.is_auth_error());
    }

    #[tokio::test]
    async fn embeddings_return_first_vector() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .and(body_partial_json(json!({"input": "hello"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"data": [{"embedding": [0.5, -1.0]}]})),
            )
            .mount(&server)
            .await;
        let p = provider(&server, ProviderType::OpenAi);
        let v = p
            .generate_embeddings(&RequestContext::new(), "text-embedding-3-small", "hello")
            .await
            .unwrap();
        assert_eq!(v, vec![0.5, -1.0]);
    }
}
