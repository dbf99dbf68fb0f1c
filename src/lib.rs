//! # infergate - one streaming client for many inference back-ends
//!
//! A single adapter interface over Ollama (native and OpenAI-compatible
//! dialects), OpenAI-style APIs (OpenAI, Qwen, Cerebras, OpenRouter),
//! Anthropic and Gemini. Every chat completion is a [`ChatStream`] of uniform
//! [`ChatCompletionChunk`]s that ends with exactly one `done` chunk.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use infergate::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), LlmError> {
//!     let provider = ProviderFactory::new().create(&ProviderConfig::new(ProviderType::Ollama))?;
//!     let client = ProviderClient::new(provider);
//!
//!     let options = GenerateOptions::new("llama3.2").message(ChatMessage::user("Hello!"));
//!     let mut stream = client
//!         .generate_chat_completion(&RequestContext::new(), options)
//!         .await?;
//!     while let Some(chunk) = stream.next().await? {
//!         print!("{}", chunk.text());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Layout
//!
//! - [`http`]: pooled transport with retry/backoff and interceptors
//! - [`streaming`]: SSE and NDJSON decoders, translators and [`ChatStream`]
//! - [`ratelimit`]: header parsers and the per-model bookkeeper
//! - [`auth`]: API-key rings, OAuth device/PKCE flows and token refresh
//! - [`providers`]: one adapter per back-end
//! - [`provider`]: the factory and the metrics-tracking facade

#![deny(unsafe_code)]

pub mod auth;
pub mod config;
pub mod context;
pub mod error;
pub mod http;
pub mod json_path;
pub mod provider;
pub mod providers;
pub mod ratelimit;
pub mod streaming;
pub mod types;
pub mod utils;

pub use config::{AppConfig, AuthMode, OAuthCredential, ProviderConfig, ProviderType};
pub use context::RequestContext;
pub use error::{ErrorKind, LlmError};
pub use provider::{Gateway, ProviderClient, ProviderFactory, ProviderMetricsSnapshot};
pub use providers::LlmProvider;
pub use streaming::{ChatResponse, ChatStream};
pub use types::{
    ChatCompletionChunk, ChatMessage, GenerateOptions, ModelInfo, ResponseFormat, Tool, ToolCall,
    ToolChoice, Usage,
};

/// Common imports
pub mod prelude {
    pub use crate::config::{AppConfig, ProviderConfig, ProviderType};
    pub use crate::context::RequestContext;
    pub use crate::error::LlmError;
    pub use crate::provider::{Gateway, ProviderClient, ProviderFactory};
    pub use crate::providers::LlmProvider;
    pub use crate::streaming::{ChatResponse, ChatStream};
    pub use crate::types::{
        ChatCompletionChunk, ChatMessage, GenerateOptions, MessageRole, ResponseFormat, Tool,
        ToolCall, ToolChoice, Usage,
    };
}
