//! OpenAI-style SSE chunk translation.
//!
//! Content deltas are forwarded as they arrive. Tool-call fragments are
//! folded into a [`ToolCallAccumulator`] and the assembled calls ride on the
//! single terminal chunk, so callers never see a half-built arguments string.
//! The terminal chunk is produced by `data: [DONE]`, or at end of transport
//! when a finish reason was already reported.

use serde::Deserialize;

use crate::error::LlmError;
use crate::streaming::{StreamEvent, StreamTranslator, ToolCallAccumulator};
use crate::types::{ChatCompletionChunk, ToolCallDelta, Usage, normalize_finish_reason};

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct WireToolCallDelta {
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<WireFunctionDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct WireFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub(crate) struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: Option<u32>,
}

impl From<WireUsage> for Usage {
    fn from(u: WireUsage) -> Self {
        let mut usage = Usage::new(u.prompt_tokens, u.completion_tokens);
        if let Some(total) = u.total_tokens {
            usage.total_tokens = usage.total_tokens.max(total);
        }
        usage
    }
}

#[derive(Debug, Default)]
pub struct OpenAiTranslator {
    id: String,
    model: String,
    tools: ToolCallAccumulator,
    finish_reason: Option<String>,
    usage: Option<Usage>,
    done: bool,
}

impl OpenAiTranslator {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    fn terminal(&mut self) -> Result<ChatCompletionChunk, LlmError> {
        self.done = true;
        let calls = self.tools.finish()?;
        let reason = self.finish_reason.clone().unwrap_or_default();
        Ok(ChatCompletionChunk::terminal(self.id.clone(), self.model.clone(), reason)
            .with_usage(self.usage)
            .with_assembled_tool_calls(&calls))
    }
}

fn api_error(err: &serde_json::Value) -> LlmError {
    let message = err
        .get("message")
        .and_then(|m| m.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| err.to_string());
    let code = err
        .get("code")
        .and_then(|c| c.as_u64())
        .and_then(|c| u16::try_from(c).ok())
        .unwrap_or(500);
    LlmError::api_error(code, message)
}

impl StreamTranslator for OpenAiTranslator {
    fn translate(&mut self, event: &StreamEvent) -> Result<Vec<ChatCompletionChunk>, LlmError> {
        if self.done {
            return Ok(Vec::new());
        }
        if event.is_done_sentinel() {
            return Ok(vec![self.terminal()?]);
        }
        if event.data.trim().is_empty() {
            return Ok(Vec::new());
        }
        let chunk: StreamChunk = serde_json::from_str(&event.data).map_err(|e| {
            LlmError::ParseError(format!("malformed chat chunk: {e}"))
        })?;
        if let Some(err) = &chunk.error {
            return Err(api_error(err));
        }
        if let Some(id) = chunk.id.filter(|s| !s.is_empty()) {
            self.id = id;
        }
        if let Some(model) = chunk.model.filter(|s| !s.is_empty()) {
            self.model = model;
        }
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage.into());
        }

        let mut out = Vec::new();
        for choice in chunk.choices {
            let delta = choice.delta.unwrap_or_default();
            for (pos, tc) in delta.tool_calls.into_iter().enumerate() {
                let function = tc.function.unwrap_or_default();
                self.tools.apply(&ToolCallDelta {
                    index: tc.index.unwrap_or(pos),
                    id: tc.id,
                    name: function.name,
                    arguments: function.arguments.unwrap_or_default(),
                });
            }
            if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
                out.push(ChatCompletionChunk::content(
                    self.id.clone(),
                    self.model.clone(),
                    text,
                ));
            }
            if let Some(reason) = choice.finish_reason.filter(|r| !r.is_empty()) {
                self.finish_reason = Some(normalize_finish_reason(&reason).to_string());
            }
        }
        Ok(out)
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

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(data: &str) -> StreamEvent {
        StreamEvent::message(data)
    }

    #[test]
    fn tool_call_fragments_assemble_on_terminal_chunk() {
        let mut t = OpenAiTranslator::new("gpt");
        let frames = [
            r#"{"id":"c1","choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_abc","function":{"name":"get_weather","arguments":""}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"loc"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"ation\":"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"SF\"}"}}]}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
        ];
        for f in frames {
            assert!(t.translate(&ev(f)).unwrap().is_empty());
        }
        let last = t.translate(&ev("[DONE]")).unwrap();
        assert_eq!(last.len(), 1);
        let chunk = &last[0];
        assert!(chunk.done);
        assert_eq!(chunk.finish_reason, "tool_calls");
        let calls = chunk.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].id.as_deref(), Some("call_abc"));
        assert_eq!(calls[0].name.as_deref(), Some("get_weather"));
        assert_eq!(calls[0].arguments, r#"{"location":"SF"}"#);
    }

    #[test]
    fn usage_from_last_chunk_lands_on_terminal() {
        let mut t = OpenAiTranslator::new("gpt");
        let out = t
            .translate(&ev(r#"{"id":"x","model":"gpt-4o","choices":[{"delta":{"content":"Hi"},"finish_reason":"stop"}]}"#))
            .unwrap();
        assert_eq!(out[0].text(), "Hi");
        assert_eq!(out[0].model, "gpt-4o");
        t.translate(&ev(r#"{"choices":[],"usage":{"prompt_tokens":3,"completion_tokens":1,"total_tokens":4}}"#))
            .unwrap();
        let last = t.translate(&ev("[DONE]")).unwrap().remove(0);
        assert_eq!(last.usage, Some(Usage::new(3, 1)));
        assert_eq!(last.finish_reason, "stop");
    }

    #[test]
    fn finish_without_done_sentinel() {
        let mut t = OpenAiTranslator::new("m");
        t.translate(&ev(r#"{"choices":[{"delta":{"content":"x"},"finish_reason":"length"}]}"#))
            .unwrap();
        let out = t.finish().unwrap();
        assert!(out[0].done);
        assert_eq!(out[0].finish_reason, "length");
        assert!(t.finish().unwrap().is_empty());
    }

    #[test]
    fn in_band_error_ends_the_stream() {
        let mut t = OpenAiTranslator::new("m");
        let err = t
            .translate(&ev(r#"{"error":{"message":"overloaded","code":503}}"#))
            .unwrap_err();
        assert_eq!(err.status_code(), Some(503));
        assert!(!err.is_skippable_decode_error());
    }

    #[test]
    fn malformed_frame_is_skippable() {
        let mut t = OpenAiTranslator::new("m");
        assert!(t.translate(&ev("{oops")).unwrap_err().is_skippable_decode_error());
    }

    #[test]
    fn invalid_assembled_arguments_fail() {
        let mut t = OpenAiTranslator::new("m");
        t.translate(&ev(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c","function":{"name":"f","arguments":"{\"a\":"}}]}}]}"#))
            .unwrap();
        assert!(t.translate(&ev("[DONE]")).is_err());
    }
}
