//! Ollama adapter
//!
//! Speaks either the native `/api/chat` NDJSON dialect or the
//! OpenAI-compatible `/v1/chat/completions` SSE dialect, chosen by the
//! `endpoint_format` option. Local servers need no credentials; the cloud
//! endpoint takes a bearer API key.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use super::LlmProvider;
use super::common::{AuthScheme, ProviderCore, status_ok};
use super::openai::{OpenAiTranslator, wire as openai_wire};
use crate::auth::CredentialStore;
use crate::config::{ProviderConfig, ProviderType};
use crate::context::RequestContext;
use crate::error::LlmError;
use crate::http::{HttpHeaderBuilder, HttpRequest};
use crate::ratelimit::{GenericRateLimitParser, RateLimitTracker};
use crate::streaming::{ChatStream, StreamFormat, StreamTranslator};
use crate::types::{
    ChatMessage, GenerateOptions, HealthStatus, ModelInfo, RunningModel, ToolFormat,
};

pub mod models;
pub mod stream;
pub mod wire;

pub use models::{CreateModelRequest, ModelDetails, ProgressStream};
pub use stream::OllamaTranslator;

pub const DEFAULT_MODEL: &str = "llama3.2";
const CLOUD_HOST: &str = "ollama.com";

/// Which chat dialect to speak.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EndpointFormat {
    #[default]
    Native,
    OpenAi,
}

impl EndpointFormat {
    pub fn parse(raw: &str) -> Result<Self, LlmError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "native" | "ollama" => Ok(Self::Native),
            "openai" | "openai-compatible" | "v1" => Ok(Self::OpenAi),
            other => Err(LlmError::ConfigurationError(format!(
                "unknown endpoint_format '{other}' (expected native or openai)"
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    embedding: Vec<f32>,
}

#[derive(Debug)]
pub struct OllamaProvider {
    pub(crate) core: ProviderCore,
    format: EndpointFormat,
}

impl OllamaProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self, LlmError> {
        Self::with_store(config, None)
    }

    pub fn with_store(
        config: &ProviderConfig,
        store: Option<Arc<CredentialStore>>,
    ) -> Result<Self, LlmError> {
        let format = EndpointFormat::parse(config.option_str("endpoint_format").unwrap_or(""))?;
        let core = ProviderCore::new(
            config,
            AuthScheme::Bearer,
            Arc::new(GenericRateLimitParser),
            store,
        )?;
        Ok(Self { core, format })
    }

    pub fn core(&self) -> &ProviderCore {
        &self.core
    }

    pub fn endpoint_format(&self) -> EndpointFormat {
        self.format
    }

    /// True for Ollama's hosted service.
    pub fn is_cloud(&self) -> bool {
        self.core.provider_type == ProviderType::OllamaCloud
            || crate::utils::host_of(&self.core.base_url).contains(CLOUD_HOST)
    }

    fn require_credentials(&self, operation: &str) -> Result<(), LlmError> {
        if self.is_cloud() && !self.core.has_credentials() {
            return Err(LlmError::MissingApiKey(
                "Ollama cloud requires an API key (set OLLAMA_API_KEY or api_key)".into(),
            )
            .with_context(self.core.name.clone(), operation));
        }
        Ok(())
    }

    /// The streaming request for `options` in the configured dialect.
    pub fn chat_request(&self, options: &GenerateOptions) -> Result<(String, HttpRequest), LlmError> {
        options.validate()?;
        let model = options.resolve_model(&self.default_model())?;
        let req = match self.format {
            EndpointFormat::Native => {
                let body = wire::build_chat_request(&model, options)?;
                let headers = HttpHeaderBuilder::new()
                    .with_accept("application/x-ndjson")
                    .build();
                HttpRequest::post_json(self.core.url("/api/chat"), &body)?.with_headers(headers)
            }
            EndpointFormat::OpenAi => {
                wire::validate_model_name(&model)?;
                let body = openai_wire::build_chat_request(&model, options, true);
                let headers = HttpHeaderBuilder::new()
                    .with_accept("text/event-stream")
                    .build();
                HttpRequest::post_json(self.core.url("/v1/chat/completions"), &body)?
                    .with_headers(headers)
            }
        };
        Ok((model.clone(), req.for_model(model)))
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn provider_type(&self) -> ProviderType {
        self.core.provider_type.clone()
    }

    fn is_authenticated(&self) -> bool {
        !self.is_cloud() || self.core.has_credentials()
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
        if let Some(models) = self.core.cached_models("tags") {
            return Ok(models);
        }
        self.require_credentials("get_models")?;
        let req = HttpRequest::get(self.core.url("/api/tags"));
        let tags: models::TagList = self.core.send_json(ctx, &req, "get_models").await?;
        let list: Vec<ModelInfo> = tags
            .models
            .into_iter()
            .map(|m| models::to_model_info(m, &self.core.name))
            .collect();
        self.core.cache_models("tags", &list);
        Ok(list)
    }

    async fn get_running_models(&self, ctx: &RequestContext) -> Result<Vec<RunningModel>, LlmError> {
        self.require_credentials("get_running_models")?;
        let req = HttpRequest::get(self.core.url("/api/ps"));
        let list: models::RunningList = self.core.send_json(ctx, &req, "get_running_models").await?;
        Ok(list.models)
    }

    async fn generate_chat_completion(
        &self,
        ctx: &RequestContext,
        options: GenerateOptions,
    ) -> Result<ChatStream, LlmError> {
        self.require_credentials("chat")?;
        let (model, req) = self
            .chat_request(&options)
            .map_err(|e| e.with_context(self.core.name.clone(), "chat"))?;
        let (fallback, translator): (StreamFormat, Box<dyn StreamTranslator>) = match self.format {
            EndpointFormat::Native => (StreamFormat::Ndjson, Box::new(OllamaTranslator::new(model))),
            EndpointFormat::OpenAi => (StreamFormat::Sse, Box::new(OpenAiTranslator::new(model))),
        };
        self.core.open_stream(ctx, req, fallback, translator).await
    }

    async fn generate_embeddings(
        &self,
        ctx: &RequestContext,
        model: &str,
        text: &str,
    ) -> Result<Vec<f32>, LlmError> {
        wire::validate_model_name(model)?;
        self.require_credentials("embeddings")?;
        let req = HttpRequest::post_json(
            self.core.url("/api/embeddings"),
            &json!({"model": model, "prompt": text}),
        )?
        .for_model(model);
        let resp: EmbeddingResponse = self.core.send_json(ctx, &req, "embeddings").await?;
        if resp.embedding.is_empty() {
            return Err(LlmError::ParseError("empty embedding returned".into())
                .with_context(self.core.name.clone(), "embeddings"));
        }
        Ok(resp.embedding)
    }

    async fn health_check(&self, ctx: &RequestContext) -> Result<HealthStatus, LlmError> {
        let urls = [self.core.url("/api/version"), self.core.url("/")];
        self.core.poll_health(ctx, &urls, status_ok).await
    }

    fn tool_format(&self) -> ToolFormat {
        match self.format {
            EndpointFormat::Native => ToolFormat::Ollama,
            EndpointFormat::OpenAi => ToolFormat::OpenAi,
        }
    }

    fn encode_messages(&self, messages: &[ChatMessage]) -> Result<Value, LlmError> {
        match self.format {
            EndpointFormat::Native => wire::encode_messages(messages),
            EndpointFormat::OpenAi => Ok(openai_wire::encode_messages(messages)),
        }
    }

    fn decode_messages(&self, wire: &Value) -> Result<Vec<ChatMessage>, LlmError> {
        match self.format {
            EndpointFormat::Native => wire::decode_messages(wire),
            EndpointFormat::OpenAi => openai_wire::decode_messages(wire),
        }
    }

    fn rate_limits(&self) -> Arc<RateLimitTracker> {
        self.core.rate_limits.clone()
    }
}
