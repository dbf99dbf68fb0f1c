//! Google Gemini (Generative Language API) adapter

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use super::LlmProvider;
use super::common::{AuthScheme, ProviderCore, status_ok};
use crate::auth::CredentialStore;
use crate::config::{AuthMode, ProviderConfig, ProviderType};
use crate::context::RequestContext;
use crate::error::LlmError;
use crate::http::{HttpHeaderBuilder, HttpRequest};
use crate::ratelimit::{GenericRateLimitParser, RateLimitTracker};
use crate::streaming::{ChatStream, StreamFormat};
use crate::types::{
    ChatMessage, GenerateOptions, HealthStatus, ModelCapability, ModelInfo, ToolFormat,
};

pub mod stream;
pub mod wire;

pub use stream::GeminiTranslator;

pub const DEFAULT_API_VERSION: &str = "v1beta";
pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    models: Vec<WireModel>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireModel {
    name: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    input_token_limit: Option<u64>,
    #[serde(default)]
    supported_generation_methods: Vec<String>,
}

impl WireModel {
    fn into_info(self, provider: &str) -> ModelInfo {
        let id = self.name.strip_prefix("models/").unwrap_or(&self.name).to_string();
        let mut info = ModelInfo::new(id.clone(), provider);
        let methods = &self.supported_generation_methods;
        let mut caps = Vec::new();
        if methods.iter().any(|m| m == "generateContent") {
            caps.extend([ModelCapability::Chat, ModelCapability::Tools, ModelCapability::Vision]);
        }
        if methods.iter().any(|m| m == "embedContent") {
            caps.push(ModelCapability::Embeddings);
        }
        if !caps.is_empty() {
            info.capabilities = caps;
        }
        info.context_length = self.input_token_limit.and_then(|n| u32::try_from(n).ok());
        info.family = id.split('-').take(2).collect::<Vec<_>>().join("-").into();
        if let Some(name) = self.display_name {
            info.name = name;
        }
        info
    }
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: Embedding,
}

#[derive(Debug, Deserialize)]
struct Embedding {
    #[serde(default)]
    values: Vec<f32>,
}

#[derive(Debug)]
pub struct GeminiProvider {
    core: ProviderCore,
    api_version: String,
}

impl GeminiProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self, LlmError> {
        Self::with_store(config, None)
    }

    pub fn with_store(
        config: &ProviderConfig,
        store: Option<Arc<CredentialStore>>,
    ) -> Result<Self, LlmError> {
        let scheme = match config.effective_auth_mode() {
            AuthMode::OAuth => AuthScheme::Bearer,
            _ => AuthScheme::Header("x-goog-api-key"),
        };
        let core = ProviderCore::new(config, scheme, Arc::new(GenericRateLimitParser), store)?;
        let api_version = config
            .option_str("api_version")
            .unwrap_or(DEFAULT_API_VERSION)
            .trim_matches('/')
            .to_string();
        Ok(Self { core, api_version })
    }

    pub fn core(&self) -> &ProviderCore {
        &self.core
    }

    fn model_url(&self, model: &str, method: &str) -> String {
        let model = model.strip_prefix("models/").unwrap_or(model);
        self.core
            .url(&format!("/{}/models/{model}:{method}", self.api_version))
    }

    pub fn chat_request(&self, options: &GenerateOptions) -> Result<(String, HttpRequest), LlmError> {
        options.validate()?;
        let model = options.resolve_model(&self.default_model())?;
        let body = wire::build_chat_request(options)?;
        let url = format!("{}?alt=sse", self.model_url(&model, "streamGenerateContent"));
        let headers = HttpHeaderBuilder::new()
            .with_accept("text/event-stream")
            .build();
        let req = HttpRequest::post_json(url, &body)?
            .with_headers(headers)
            .for_model(model.clone());
        Ok((model, req))
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
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
            DEFAULT_MODEL.to_string()
        } else {
            self.core.default_model.clone()
        }
    }

    async fn get_models(&self, ctx: &RequestContext) -> Result<Vec<ModelInfo>, LlmError> {
        if let Some(models) = self.core.cached_models("models") {
            return Ok(models);
        }
        let req = HttpRequest::get(self.core.url(&format!("/{}/models", self.api_version)));
        let list: ModelList = self.core.send_json(ctx, &req, "get_models").await?;
        let models: Vec<ModelInfo> = list
            .models
            .into_iter()
            .map(|m| m.into_info(&self.core.name))
            .collect();
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
            .open_stream(ctx, req, StreamFormat::Sse, Box::new(GeminiTranslator::new(model)))
            .await
    }

    async fn generate_embeddings(
        &self,
        ctx: &RequestContext,
        model: &str,
        text: &str,
    ) -> Result<Vec<f32>, LlmError> {
        let body = json!({"content": {"parts": [{"text": text}]}});
        let req = HttpRequest::post_json(self.model_url(model, "embedContent"), &body)?.for_model(model);
        let resp: EmbedResponse = self.core.send_json(ctx, &req, "embeddings").await?;
        Ok(resp.embedding.values)
    }

    async fn health_check(&self, ctx: &RequestContext) -> Result<HealthStatus, LlmError> {
        self.core
            .poll_health(ctx, &[self.core.url("/v1/models")], status_ok)
            .await
    }

    fn tool_format(&self) -> ToolFormat {
        ToolFormat::Gemini
    }

    fn encode_messages(&self, messages: &[ChatMessage]) -> Result<Value, LlmError> {
        wire::encode_messages(messages)
    }

    fn decode_messages(&self, wire: &Value) -> Result<Vec<ChatMessage>, LlmError> {
        wire::decode_messages(wire)
    }

    fn rate_limits(&self) -> Arc<RateLimitTracker> {
        self.core.rate_limits.clone()
    }
}
