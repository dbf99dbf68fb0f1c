//! Provider adapters
//!
//! One adapter per wire dialect. Every adapter embeds a [`ProviderCore`]
//! (HTTP transport, credentials, rate-limit bookkeeper, caches) and adds its
//! own request builder and stream translator.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::{ProviderConfig, ProviderType};
use crate::context::RequestContext;
use crate::error::LlmError;
use crate::ratelimit::RateLimitTracker;
use crate::streaming::ChatStream;
use crate::types::{
    ChatMessage, GenerateOptions, HealthStatus, ModelInfo, RunningModel, ToolFormat,
};

pub mod anthropic;
pub mod common;
pub mod gemini;
pub mod ollama;
pub mod openai;

pub use anthropic::AnthropicProvider;
pub use common::{AuthScheme, ProviderCore, RateLimitInterceptor};
pub use gemini::GeminiProvider;
pub use ollama::{EndpointFormat, OllamaProvider};
pub use openai::{OpenAiFlavor, OpenAiProvider};

/// The capability surface every adapter implements.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Human name from the provider section.
    fn name(&self) -> &str;

    fn provider_type(&self) -> ProviderType;

    fn is_authenticated(&self) -> bool;

    /// (Re)load credentials from `config`.
    async fn authenticate(&self, config: &ProviderConfig) -> Result<(), LlmError>;

    fn default_model(&self) -> String;

    async fn get_models(&self, ctx: &RequestContext) -> Result<Vec<ModelInfo>, LlmError>;

    async fn get_running_models(&self, _ctx: &RequestContext) -> Result<Vec<RunningModel>, LlmError> {
        Err(LlmError::UnsupportedOperation(format!(
            "{} does not report running models",
            self.name()
        )))
    }

    async fn generate_chat_completion(
        &self,
        ctx: &RequestContext,
        options: GenerateOptions,
    ) -> Result<ChatStream, LlmError>;

    async fn generate_embeddings(
        &self,
        _ctx: &RequestContext,
        _model: &str,
        _text: &str,
    ) -> Result<Vec<f32>, LlmError> {
        Err(LlmError::UnsupportedOperation(format!(
            "{} does not support embeddings",
            self.name()
        )))
    }

    async fn health_check(&self, ctx: &RequestContext) -> Result<HealthStatus, LlmError>;

    fn supports_tool_calling(&self) -> bool {
        true
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn supports_responses_api(&self) -> bool {
        false
    }

    fn tool_format(&self) -> ToolFormat;

    /// Messages in this adapter's wire schema.
    fn encode_messages(&self, messages: &[ChatMessage]) -> Result<Value, LlmError>;

    /// Read wire-format history back into messages.
    fn decode_messages(&self, wire: &Value) -> Result<Vec<ChatMessage>, LlmError>;

    /// Bookkeeper consulted before dispatch.
    fn rate_limits(&self) -> Arc<RateLimitTracker>;
}
