//! Request options for chat completion

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::message::{ChatMessage, validate_messages};
use super::tools::{Tool, ToolChoice, validate_tools};
use crate::error::LlmError;

/// Structured-output constraint.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    #[default]
    Unconstrained,
    Json,
    JsonSchema(Value),
}

impl ResponseFormat {
    /// Interpret a caller-supplied format string: `json` (any case) requests
    /// JSON mode, a serialized JSON object is taken as a schema, anything
    /// else leaves the output unconstrained.
    pub fn from_raw(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case("json") {
            return Self::Json;
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(v @ Value::Object(_)) => Self::JsonSchema(v),
            _ => Self::Unconstrained,
        }
    }

    pub fn is_constrained(&self) -> bool {
        !matches!(self, Self::Unconstrained)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerateOptions {
    /// Empty means "use the adapter's default model".
    #[serde(default)]
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub tools: Vec<Tool>,
    #[serde(default)]
    pub tool_choice: ToolChoice,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stop: Vec<String>,
    #[serde(default)]
    pub response_format: ResponseFormat,
    pub stream: bool,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            model: String::new(),
            messages: Vec::new(),
            tools: Vec::new(),
            tool_choice: ToolChoice::Auto,
            temperature: None,
            max_tokens: None,
            stop: Vec::new(),
            response_format: ResponseFormat::Unconstrained,
            stream: true,
        }
    }
}

impl GenerateOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn message(mut self, message: ChatMessage) -> Self {
        self.messages.push(message);
        self
    }

    pub fn messages(mut self, messages: impl IntoIterator<Item = ChatMessage>) -> Self {
        self.messages.extend(messages);
        self
    }

    pub fn tool(mut self, tool: Tool) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tool_choice(mut self, choice: ToolChoice) -> Self {
        self.tool_choice = choice;
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn stop(mut self, stop: impl Into<String>) -> Self {
        self.stop.push(stop.into());
        self
    }

    pub fn response_format(mut self, format: ResponseFormat) -> Self {
        self.response_format = format;
        self
    }

    /// Shorthand for `response_format(ResponseFormat::from_raw(raw))`.
    pub fn response_format_raw(self, raw: &str) -> Self {
        self.response_format(ResponseFormat::from_raw(raw))
    }

    /// Model to send, falling back when the caller left it empty.
    pub fn resolve_model(&self, fallback: &str) -> Result<String, LlmError> {
        let model = if self.model.trim().is_empty() {
            fallback.trim()
        } else {
            self.model.trim()
        };
        if model.is_empty() {
            return Err(LlmError::InvalidInput(
                "no model given and the provider has no default model".into(),
            ));
        }
        Ok(model.to_string())
    }

    pub fn validate(&self) -> Result<(), LlmError> {
        validate_messages(&self.messages)?;
        validate_tools(&self.tools)?;
        if let ToolChoice::Specific(name) = &self.tool_choice
            && !self.tools.iter().any(|t| &t.name == name)
        {
            return Err(LlmError::InvalidInput(format!(
                "tool_choice names unknown tool '{name}'"
            )));
        }
        if let Some(t) = self.temperature
            && !(0.0..=2.0).contains(&t)
        {
            return Err(LlmError::InvalidInput(format!(
                "temperature {t} outside 0.0..=2.0"
            )));
        }
        Ok(())
    }

    /// Prompt size estimate plus the requested completion budget.
    pub fn estimated_tokens(&self) -> u64 {
        let chars: usize = self.messages.iter().map(|m| m.text().len()).sum();
        crate::utils::estimate_tokens(chars) + u64::from(self.max_tokens.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn response_format_from_raw() {
        assert_eq!(ResponseFormat::from_raw("json"), ResponseFormat::Json);
        assert_eq!(ResponseFormat::from_raw("JSON"), ResponseFormat::Json);
        assert_eq!(
            ResponseFormat::from_raw(r#"{"type":"object","properties":{"a":{"type":"string"}}}"#),
            ResponseFormat::JsonSchema(json!({"type":"object","properties":{"a":{"type":"string"}}}))
        );
        assert_eq!(ResponseFormat::from_raw("[1,2]"), ResponseFormat::Unconstrained);
        assert_eq!(ResponseFormat::from_raw("yaml"), ResponseFormat::Unconstrained);
    }

    #[test]
    fn resolve_model_uses_fallback() {
        let opts = GenerateOptions::default();
        assert_eq!(opts.resolve_model("llama3.2").unwrap(), "llama3.2");
        assert!(opts.resolve_model("").is_err());
        let opts = GenerateOptions::new("qwen2");
        assert_eq!(opts.resolve_model("llama3.2").unwrap(), "qwen2");
    }

    #[test]
    fn token_estimate_counts_max_tokens() {
        let opts = GenerateOptions::new("m")
            .message(ChatMessage::user("12345678"))
            .max_tokens(100);
        assert_eq!(opts.estimated_tokens(), 102);
    }

    #[test]
    fn specific_tool_choice_must_exist() {
        let opts = GenerateOptions::new("m")
            .message(ChatMessage::user("x"))
            .tool_choice(ToolChoice::Specific("nope".into()));
        assert!(opts.validate().is_err());
    }
}
