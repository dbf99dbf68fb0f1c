//! Anthropic Messages API adapter

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::LlmProvider;
use super::common::{AuthScheme, ProviderCore, http_config_for, status_ok};
use crate::auth::CredentialStore;
use crate::config::{AuthMode, ProviderConfig, ProviderType};
use crate::context::RequestContext;
use crate::error::LlmError;
use crate::http::{HttpHeaderBuilder, HttpRequest};
use crate::ratelimit::{AnthropicRateLimitParser, RateLimitTracker};
use crate::streaming::{ChatStream, StreamFormat};
use crate::types::{ChatMessage, GenerateOptions, HealthStatus, ModelInfo, ToolFormat};

pub mod stream;
pub mod wire;

pub use stream::AnthropicTranslator;

pub const DEFAULT_API_VERSION: &str = "2023-06-01";
pub const DEFAULT_MODEL: &str = "claude-3-5-sonnet-latest";

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<WireModel>,
}

#[derive(Debug, Deserialize)]
struct WireModel {
    id: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    created_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug)]
pub struct AnthropicProvider {
    core: ProviderCore,
}

impl AnthropicProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self, LlmError> {
        Self::with_store(config, None)
    }

    pub fn with_store(
        config: &ProviderConfig,
        store: Option<Arc<CredentialStore>>,
    ) -> Result<Self, LlmError> {
        let version = config
            .option_str("anthropic_version")
            .unwrap_or(DEFAULT_API_VERSION)
            .to_string();
        // OAuth tokens go in the Authorization header; API keys in x-api-key.
        let scheme = match config.effective_auth_mode() {
            AuthMode::OAuth => AuthScheme::Bearer,
            _ => AuthScheme::Header("x-api-key"),
        };
        let core = ProviderCore::new(config, scheme, Arc::new(AnthropicRateLimitParser), store)?
            .with_http_config(http_config_for(config).with_header("anthropic-version", version))?;
        Ok(Self { core })
    }

    pub fn core(&self) -> &ProviderCore {
        &self.core
    }

    pub fn chat_request(&self, options: &GenerateOptions) -> Result<(String, HttpRequest), LlmError> {
        options.validate()?;
        let model = options.resolve_model(&self.default_model())?;
        let body = wire::build_chat_request(&model, options)?;
        let headers = HttpHeaderBuilder::new()
            .with_accept("text/event-stream")
            .build();
        let req = HttpRequest::post_json(self.core.url("/v1/messages"), &body)?
            .with_headers(headers)
            .for_model(model.clone());
        Ok((model, req))
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
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
        let req = HttpRequest::get(self.core.url("/v1/models"));
        let list: ModelList = self.core.send_json(ctx, &req, "get_models").await?;
        let models: Vec<ModelInfo> = list
            .data
            .into_iter()
            .map(|m| {
                let mut info = ModelInfo::new(m.id, self.core.name.clone());
                info.capabilities = vec![
                    crate::types::ModelCapability::Chat,
                    crate::types::ModelCapability::Tools,
                    crate::types::ModelCapability::Vision,
                ];
                info.context_length = Some(200_000);
                if let Some(name) = m.display_name {
                    info.name = name;
                }
                info.modified_at = m.created_at;
                info.family = Some("claude".into());
                info
            })
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
            .open_stream(ctx, req, StreamFormat::Sse, Box::new(AnthropicTranslator::new(model)))
            .await
    }

    /// `GET /v1/messages` answers 405 on a reachable, authorized endpoint.
    async fn health_check(&self, ctx: &RequestContext) -> Result<HealthStatus, LlmError> {
        self.core
            .poll_health(ctx, &[self.core.url("/v1/messages")], |s| status_ok(s) || s == 405)
            .await
    }

    fn tool_format(&self) -> ToolFormat {
        ToolFormat::Anthropic
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
