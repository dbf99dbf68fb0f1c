//! Uniform streamed response unit

use serde::{Deserialize, Serialize};

use super::tools::{ToolCall, ToolCallDelta};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    /// Build from prompt/completion counts; total is derived.
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }

    /// Fold a later partial report into this one, keeping the larger counts.
    pub fn merge(&mut self, other: &Usage) {
        self.prompt_tokens = self.prompt_tokens.max(other.prompt_tokens);
        self.completion_tokens = self.completion_tokens.max(other.completion_tokens);
        self.total_tokens = self
            .total_tokens
            .max(other.total_tokens)
            .max(self.prompt_tokens.saturating_add(self.completion_tokens));
    }
}

pub mod finish_reason {
    pub const STOP: &str = "stop";
    pub const LENGTH: &str = "length";
    pub const TOOL_CALLS: &str = "tool_calls";
    pub const CONTENT_FILTER: &str = "content_filter";
    pub const NONE: &str = "";
}

/// Map a provider finish/stop reason onto the uniform set
/// `stop`, `length`, `tool_calls`, `content_filter`, or empty.
pub fn normalize_finish_reason(raw: &str) -> &'static str {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "null" => finish_reason::NONE,
        "stop" | "end_turn" | "stop_sequence" | "eos" | "finish_reason_stop" | "unload" | "load" => {
            finish_reason::STOP
        }
        "length" | "max_tokens" | "max_output_tokens" | "model_length" => finish_reason::LENGTH,
        "tool_calls" | "tool_use" | "function_call" => finish_reason::TOOL_CALLS,
        "content_filter" | "safety" | "recitation" | "blocklist" | "prohibited_content" | "spii"
        | "refusal" => finish_reason::CONTENT_FILTER,
        _ => finish_reason::STOP,
    }
}

/// One element of a chat completion stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
    #[serde(default)]
    pub finish_reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    pub done: bool,
}

impl ChatCompletionChunk {
    pub fn content(id: impl Into<String>, model: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            content: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn terminal(
        id: impl Into<String>,
        model: impl Into<String>,
        finish_reason: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            finish_reason: finish_reason.into(),
            done: true,
            ..Default::default()
        }
    }

    pub fn with_usage(mut self, usage: Option<Usage>) -> Self {
        self.usage = usage;
        self
    }

    /// Attach fully assembled tool calls, one delta per call carrying the whole record.
    pub fn with_assembled_tool_calls(mut self, calls: &[ToolCall]) -> Self {
        if calls.is_empty() {
            return self;
        }
        self.tool_calls = Some(
            calls
                .iter()
                .enumerate()
                .map(|(index, call)| ToolCallDelta {
                    index,
                    id: Some(call.id.clone()),
                    name: Some(call.name.clone()),
                    arguments: call.arguments.clone(),
                })
                .collect(),
        );
        self
    }

    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        !self.done
            && self.content.as_deref().is_none_or(str::is_empty)
            && self.tool_calls.as_ref().is_none_or(Vec::is_empty)
            && self.usage.is_none()
            && self.finish_reason.is_empty()
    }
}
