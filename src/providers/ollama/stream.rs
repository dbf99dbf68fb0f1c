//! Ollama native NDJSON chunk translation.
//!
//! Every line is a complete JSON object. Content is forwarded line by line;
//! tool calls arrive whole and are held until the `done: true` line, which
//! also carries the token counters.

use serde::Deserialize;
use serde_json::Value;

use super::wire::arguments_string;
use crate::error::LlmError;
use crate::streaming::{StreamEvent, StreamTranslator, ToolCallAccumulator};
use crate::types::{
    ChatCompletionChunk, ToolCall, Usage, finish_reason, normalize_finish_reason,
};

#[derive(Debug, Deserialize)]
struct ChatLine {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    message: Option<LineMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LineMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<LineToolCall>,
}

#[derive(Debug, Deserialize)]
struct LineToolCall {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<LineFunction>,
}

#[derive(Debug, Deserialize)]
struct LineFunction {
    #[serde(default)]
    name: String,
    #[serde(default)]
    arguments: Option<Value>,
}

#[derive(Debug)]
pub struct OllamaTranslator {
    id: String,
    model: String,
    tools: ToolCallAccumulator,
    done: bool,
}

impl OllamaTranslator {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: format!("ollama-{}", uuid::Uuid::new_v4().simple()),
            model: model.into(),
            tools: ToolCallAccumulator::new(),
            done: false,
        }
    }
}

impl StreamTranslator for OllamaTranslator {
    fn translate(&mut self, event: &StreamEvent) -> Result<Vec<ChatCompletionChunk>, LlmError> {
        if self.done || event.data.trim().is_empty() {
            return Ok(Vec::new());
        }
        let line: ChatLine = serde_json::from_str(&event.data)
            .map_err(|e| LlmError::ParseError(format!("malformed chat line: {e}")))?;
        if let Some(err) = line.error {
            return Err(LlmError::api_error(500, err));
        }
        if let Some(model) = line.model.filter(|m| !m.is_empty()) {
            self.model = model;
        }

        let message = line.message.unwrap_or_default();
        for call in message.tool_calls {
            let Some(function) = call.function else {
                continue;
            };
            let id = call
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| format!("call_{}", self.tools.len()));
            self.tools.push_complete(ToolCall::new(
                id,
                function.name,
                arguments_string(function.arguments.as_ref()),
            ));
        }

        if !line.done {
            if message.content.is_empty() {
                return Ok(Vec::new());
            }
            return Ok(vec![ChatCompletionChunk::content(
                self.id.clone(),
                self.model.clone(),
                message.content,
            )]);
        }

        self.done = true;
        let calls = self.tools.finish()?;
        let reason = match line.done_reason.as_deref() {
            _ if !calls.is_empty() => finish_reason::TOOL_CALLS,
            Some(raw) => normalize_finish_reason(raw),
            None => finish_reason::STOP,
        };
        let usage = match (line.prompt_eval_count, line.eval_count) {
            (None, None) => None,
            (p, c) => Some(Usage::new(p.unwrap_or(0), c.unwrap_or(0))),
        };
        let mut chunk = ChatCompletionChunk::terminal(self.id.clone(), self.model.clone(), reason)
            .with_usage(usage)
            .with_assembled_tool_calls(&calls);
        if !message.content.is_empty() {
            chunk.content = Some(message.content);
        }
        Ok(vec![chunk])
    }

    fn identity(&self) -> (String, String) {
        (self.id.clone(), self.model.clone())
    }
}
