//! Tool definitions and tool-call records

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::LlmError;

/// A function the model may call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON schema for the arguments; top-level type is always `object`.
    pub parameters: Value,
}

impl Tool {
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    pub fn validate(&self) -> Result<(), LlmError> {
        if self.name.trim().is_empty() {
            return Err(LlmError::InvalidInput("tool name must not be empty".into()));
        }
        match self.parameters.get("type").and_then(Value::as_str) {
            Some("object") => Ok(()),
            other => Err(LlmError::InvalidInput(format!(
                "tool '{}' parameters must be a schema of type \"object\" (got {:?})",
                self.name, other
            ))),
        }
    }
}

/// Check a tool list: each tool valid, names unique.
pub fn validate_tools(tools: &[Tool]) -> Result<(), LlmError> {
    let mut names = std::collections::HashSet::new();
    for tool in tools {
        tool.validate()?;
        if !names.insert(tool.name.as_str()) {
            return Err(LlmError::InvalidInput(format!(
                "duplicate tool name '{}'",
                tool.name
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    #[default]
    Auto,
    Required,
    None,
    Specific(String),
}

/// An assembled tool call. `arguments` is a serialized JSON string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    pub fn arguments_json(&self) -> Result<Value, LlmError> {
        serde_json::from_str(&self.arguments).map_err(|e| {
            LlmError::ParseError(format!("tool call '{}' arguments: {e}", self.id))
        })
    }
}

/// A streamed tool-call fragment tagged with its slot index.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCallDelta {
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: String,
}

/// Tool schema dialect an adapter expects on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolFormat {
    OpenAi,
    Anthropic,
    Gemini,
    Ollama,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_schema_must_be_object() {
        let bad = Tool::function("f", "", json!({"type": "string"}));
        assert!(bad.validate().is_err());
        let good = Tool::function("f", "", json!({"type": "object", "properties": {}}));
        assert!(good.validate().is_ok());
    }

    #[test]
    fn duplicate_tool_names_rejected() {
        let t = Tool::function("f", "", json!({"type": "object"}));
        assert!(validate_tools(&[t.clone(), t]).is_err());
    }
}
