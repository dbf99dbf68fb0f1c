//! Anthropic SSE event translation.
//!
//! Text arrives as `text_delta`s; tool input as `input_json_delta` fragments
//! keyed by content-block index. `message_delta` reports the stop reason and
//! output token count, and `message_stop` ends the stream.

use serde::Deserialize;
use serde_json::Value;

use crate::error::LlmError;
use crate::streaming::{StreamEvent, StreamTranslator, ToolCallAccumulator};
use crate::types::{ChatCompletionChunk, ToolCallDelta, Usage, normalize_finish_reason};

#[derive(Debug, Deserialize)]
struct Event {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    message: Option<StartMessage>,
    #[serde(default)]
    content_block: Option<Value>,
    #[serde(default)]
    delta: Option<Value>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    error: Option<WireError>,
}

#[derive(Debug, Deserialize)]
struct StartMessage {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Default, Clone, Copy, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: Option<u32>,
    #[serde(default)]
    output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

impl WireError {
    fn into_error(self) -> LlmError {
        match self.kind.as_str() {
            "authentication_error" | "permission_error" => {
                LlmError::AuthenticationError(self.message)
            }
            "rate_limit_error" => LlmError::rate_limited(self.message, None),
            "not_found_error" => LlmError::NotFound(self.message),
            "invalid_request_error" => LlmError::api_error(400, self.message),
            "overloaded_error" => LlmError::api_error(529, self.message),
            _ => LlmError::api_error(500, format!("{}: {}", self.kind, self.message)),
        }
    }
}

#[derive(Debug, Default)]
pub struct AnthropicTranslator {
    id: String,
    model: String,
    tools: ToolCallAccumulator,
    input_tokens: u32,
    output_tokens: u32,
    saw_usage: bool,
    finish_reason: Option<String>,
    done: bool,
}

impl AnthropicTranslator {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    fn record_usage(&mut self, usage: WireUsage) {
        if let Some(i) = usage.input_tokens {
            self.input_tokens = self.input_tokens.max(i);
            self.saw_usage = true;
        }
        if let Some(o) = usage.output_tokens {
            self.output_tokens = self.output_tokens.max(o);
            self.saw_usage = true;
        }
    }

    fn terminal(&mut self) -> Result<ChatCompletionChunk, LlmError> {
        self.done = true;
        let calls = self.tools.finish()?;
        let usage = self
            .saw_usage
            .then(|| Usage::new(self.input_tokens, self.output_tokens));
        Ok(ChatCompletionChunk::terminal(
            self.id.clone(),
            self.model.clone(),
            self.finish_reason.clone().unwrap_or_default(),
        )
        .with_usage(usage)
        .with_assembled_tool_calls(&calls))
    }

    fn text(&self, text: &str) -> Vec<ChatCompletionChunk> {
        if text.is_empty() {
            return Vec::new();
        }
        vec![ChatCompletionChunk::content(self.id.clone(), self.model.clone(), text)]
    }
}

impl StreamTranslator for AnthropicTranslator {
    fn translate(&mut self, event: &StreamEvent) -> Result<Vec<ChatCompletionChunk>, LlmError> {
        if self.done || event.data.trim().is_empty() {
            return Ok(Vec::new());
        }
        let ev: Event = serde_json::from_str(&event.data)
            .map_err(|e| LlmError::ParseError(format!("malformed event '{}': {e}", event.event_type)))?;

        match ev.kind.as_str() {
            "message_start" => {
                if let Some(msg) = ev.message {
                    if let Some(id) = msg.id {
                        self.id = id;
                    }
                    if let Some(model) = msg.model {
                        self.model = model;
                    }
                    if let Some(usage) = msg.usage {
                        self.record_usage(usage);
                    }
                }
                Ok(Vec::new())
            }
            "content_block_start" => {
                let block = ev.content_block.unwrap_or(Value::Null);
                match block.get("type").and_then(Value::as_str) {
                    Some("tool_use") => {
                        self.tools.apply(&ToolCallDelta {
                            index: ev.index.unwrap_or(0),
                            id: block.get("id").and_then(Value::as_str).map(str::to_string),
                            name: block.get("name").and_then(Value::as_str).map(str::to_string),
                            arguments: String::new(),
                        });
                        Ok(Vec::new())
                    }
                    Some("text") => Ok(self.text(
                        block.get("text").and_then(Value::as_str).unwrap_or_default(),
                    )),
                    _ => Ok(Vec::new()),
                }
            }
            "content_block_delta" => {
                let delta = ev.delta.unwrap_or(Value::Null);
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => Ok(self.text(
                        delta.get("text").and_then(Value::as_str).unwrap_or_default(),
                    )),
                    Some("input_json_delta") => {
                        self.tools.apply(&ToolCallDelta {
                            index: ev.index.unwrap_or(0),
                            id: None,
                            name: None,
                            arguments: delta
                                .get("partial_json")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                        });
                        Ok(Vec::new())
                    }
                    _ => Ok(Vec::new()),
                }
            }
            "message_delta" => {
                if let Some(reason) = ev
                    .delta
                    .as_ref()
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(Value::as_str)
                {
                    self.finish_reason = Some(normalize_finish_reason(reason).to_string());
                }
                if let Some(usage) = ev.usage {
                    self.record_usage(usage);
                }
                Ok(Vec::new())
            }
            "message_stop" => Ok(vec![self.terminal()?]),
            "error" => Err(ev
                .error
                .map(WireError::into_error)
                .unwrap_or_else(|| LlmError::api_error(500, "stream error without details"))),
            // ping, content_block_stop and anything newer
            _ => Ok(Vec::new()),
        }
    }

    fn finish(&mut self) -> Result<Vec<ChatCompletionChunk>, LlmError> {
        if self.done || self.finish_reason.is_none() {
            return Ok(Vec::new());
        }
        Ok(vec![self.terminal()?])
    }

    fn identity(&self) -> (String, String) {
        (self.id.clone(), self.model.clone())
    }
}
