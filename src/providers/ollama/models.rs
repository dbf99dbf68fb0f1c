//! Ollama model catalog and management
//!
//! Listing (`/api/tags`, `/api/ps`) works against any host. Pull, push,
//! create, delete, copy and show change or inspect a local model store and
//! are refused when the base URL points at Ollama's cloud.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::OllamaProvider;
use super::wire::validate_model_name;
use crate::context::RequestContext;
use crate::error::LlmError;
use crate::http::HttpRequest;
use crate::streaming::{ByteReader, NdjsonDecoder, StreamDecoder, response_reader};
use crate::types::{ModelCapability, ModelInfo, ProgressUpdate, RunningModel};

pub const DEFAULT_CONTEXT_LENGTH: u32 = 8_192;

#[derive(Debug, Deserialize)]
pub(super) struct TagList {
    #[serde(default)]
    pub models: Vec<TagModel>,
}

#[derive(Debug, Deserialize)]
pub(super) struct TagModel {
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub details: Option<TagDetails>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct TagDetails {
    #[serde(default)]
    pub family: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(super) struct RunningList {
    #[serde(default)]
    pub models: Vec<RunningModel>,
}

/// Context window guessed from the model name.
pub fn infer_context_length(name: &str) -> u32 {
    let name = name.to_ascii_lowercase();
    if name.contains("codellama") {
        16_384
    } else if name.contains("llama3") {
        131_072
    } else if name.contains("mistral") || name.contains("mixtral") {
        32_768
    } else {
        DEFAULT_CONTEXT_LENGTH
    }
}

/// Capabilities guessed from the model name.
pub fn infer_capabilities(name: &str) -> Vec<ModelCapability> {
    let name = name.to_ascii_lowercase();
    if name.contains("embed") {
        return vec![ModelCapability::Embeddings];
    }
    let mut caps = vec![ModelCapability::Chat];
    if ["llama3", "mistral", "mixtral", "qwen", "deepseek"]
        .iter()
        .any(|k| name.contains(k))
    {
        caps.push(ModelCapability::Tools);
    }
    if name.contains("llava") || name.contains("vision") {
        caps.push(ModelCapability::Vision);
    }
    caps
}

/// Map the catalog's own capability flags, when it reports any.
fn explicit_capabilities(flags: &[String]) -> Vec<ModelCapability> {
    let mut caps = Vec::new();
    for flag in flags {
        let cap = match flag.as_str() {
            "completion" | "chat" => ModelCapability::Chat,
            "tools" => ModelCapability::Tools,
            "vision" => ModelCapability::Vision,
            "embedding" | "embeddings" => ModelCapability::Embeddings,
            _ => continue,
        };
        if !caps.contains(&cap) {
            caps.push(cap);
        }
    }
    caps
}

pub(super) fn to_model_info(model: TagModel, provider: &str) -> ModelInfo {
    let mut info = ModelInfo::new(model.name.clone(), provider);
    info.capabilities = match explicit_capabilities(&model.capabilities) {
        caps if caps.is_empty() => infer_capabilities(&model.name),
        caps => caps,
    };
    info.context_length = Some(infer_context_length(&model.name));
    info.size_bytes = model.size;
    info.modified_at = model.modified_at;
    info.family = model.details.and_then(|d| d.family);
    info
}

/// Body for `POST /api/create`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CreateModelRequest {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantize: Option<String>,
}

impl CreateModelRequest {
    pub fn from_model(model: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            from: Some(from.into()),
            ..Default::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// `POST /api/show` response.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ModelDetails {
    #[serde(default)]
    pub modelfile: String,
    #[serde(default)]
    pub parameters: String,
    #[serde(default)]
    pub template: String,
    #[serde(default)]
    pub details: Value,
    #[serde(default)]
    pub model_info: Value,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Progress lines from a pull, push or create.
pub struct ProgressStream {
    reader: Option<Box<ByteReader>>,
    decoder: NdjsonDecoder,
    ctx: RequestContext,
}

impl std::fmt::Debug for ProgressStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressStream")
            .field("open", &self.reader.is_some())
            .finish_non_exhaustive()
    }
}

impl ProgressStream {
    pub fn new(reader: Box<ByteReader>, ctx: RequestContext) -> Self {
        Self {
            reader: Some(reader),
            decoder: NdjsonDecoder::new(),
            ctx,
        }
    }

    /// Next update, `Ok(None)` once the server closes the stream. An
    /// `error` line ends the stream with that error.
    pub async fn next(&mut self) -> Result<Option<ProgressUpdate>, LlmError> {
        loop {
            let Some(reader) = self.reader.as_mut() else {
                return Ok(None);
            };
            let decoder = &mut self.decoder;
            let event = self.ctx.run(decoder.decode(reader.as_mut())).await;
            let event = match event {
                Ok(Some(event)) => event,
                Ok(None) => {
                    self.reader = None;
                    return Ok(None);
                }
                Err(e) if e.is_skippable_decode_error() => continue,
                Err(e) => {
                    self.reader = None;
                    return Err(e);
                }
            };
            let value = match event.json() {
                Ok(v) => v,
                Err(_) => continue,
            };
            if let Some(err) = value.get("error").and_then(Value::as_str) {
                self.reader = None;
                return Err(LlmError::api_error(500, err));
            }
            let Ok(update) = serde_json::from_value::<ProgressUpdate>(value) else {
                continue;
            };
            return Ok(Some(update));
        }
    }

    /// Drain to the end; returns the last update.
    pub async fn wait(mut self) -> Result<Option<ProgressUpdate>, LlmError> {
        let mut last = None;
        while let Some(update) = self.next().await? {
            last = Some(update);
        }
        Ok(last)
    }

    pub fn close(&mut self) {
        self.reader = None;
    }
}

impl OllamaProvider {
    fn ensure_local(&self, operation: &str) -> Result<(), LlmError> {
        if self.is_cloud() {
            return Err(LlmError::UnsupportedOperation(format!(
                "{operation} is not available on Ollama cloud endpoints"
            ))
            .with_context(self.core.name.clone(), operation));
        }
        Ok(())
    }

    async fn progress(
        &self,
        ctx: &RequestContext,
        path: &str,
        body: &impl Serialize,
        operation: &str,
    ) -> Result<ProgressStream, LlmError> {
        self.ensure_local(operation)?;
        let req = HttpRequest::post_json(self.core.url(path), body)?.streaming();
        let response = self.core.send(ctx, &req, operation).await?;
        Ok(ProgressStream::new(response_reader(response), ctx.clone()))
    }

    pub async fn pull_model(&self, ctx: &RequestContext, name: &str) -> Result<ProgressStream, LlmError> {
        validate_model_name(name)?;
        tracing::info!(target: "infergate::provider", provider = %self.core.name, model = name, "pulling model");
        let stream = self
            .progress(ctx, "/api/pull", &json!({"model": name, "stream": true}), "pull")
            .await?;
        self.core.invalidate_caches();
        Ok(stream)
    }

    pub async fn push_model(&self, ctx: &RequestContext, name: &str) -> Result<ProgressStream, LlmError> {
        validate_model_name(name)?;
        self.progress(ctx, "/api/push", &json!({"model": name, "stream": true}), "push")
            .await
    }

    pub async fn create_model(
        &self,
        ctx: &RequestContext,
        request: &CreateModelRequest,
    ) -> Result<ProgressStream, LlmError> {
        validate_model_name(&request.model)?;
        let mut body = serde_json::to_value(request)?;
        body["stream"] = json!(true);
        let stream = self.progress(ctx, "/api/create", &body, "create").await?;
        self.core.invalidate_caches();
        Ok(stream)
    }

    pub async fn delete_model(&self, ctx: &RequestContext, name: &str) -> Result<(), LlmError> {
        validate_model_name(name)?;
        self.ensure_local("delete")?;
        let req = HttpRequest::post_json(self.core.url("/api/delete"), &json!({"model": name}))?
            .with_method(reqwest::Method::DELETE);
        self.core.send(ctx, &req, "delete").await?;
        self.core.invalidate_caches();
        Ok(())
    }

    pub async fn copy_model(
        &self,
        ctx: &RequestContext,
        source: &str,
        destination: &str,
    ) -> Result<(), LlmError> {
        validate_model_name(source)?;
        validate_model_name(destination)?;
        self.ensure_local("copy")?;
        let req = HttpRequest::post_json(
            self.core.url("/api/copy"),
            &json!({"source": source, "destination": destination}),
        )?;
        self.core.send(ctx, &req, "copy").await?;
        self.core.invalidate_caches();
        Ok(())
    }

    pub async fn show_model(&self, ctx: &RequestContext, name: &str) -> Result<ModelDetails, LlmError> {
        validate_model_name(name)?;
        self.ensure_local("show")?;
        let req = HttpRequest::post_json(self.core.url("/api/show"), &json!({"model": name}))?;
        self.core.send_json(ctx, &req, "show").await
    }

    /// Server version from `/api/version`.
    pub async fn version(&self, ctx: &RequestContext) -> Result<String, LlmError> {
        let req = HttpRequest::get(self.core.url("/api/version"));
        let body: Value = self.core.send_json(ctx, &req, "version").await?;
        body.get("version")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| LlmError::ParseError("version response has no version field".into()))
    }
}
