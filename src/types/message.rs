//! Chat message types

use serde::{Deserialize, Serialize};

use super::tools::ToolCall;
use crate::error::LlmError;

/// Message role
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }

    pub fn parse(role: &str) -> Result<Self, LlmError> {
        match role {
            "system" | "developer" => Ok(Self::System),
            "user" => Ok(Self::User),
            "assistant" | "model" => Ok(Self::Assistant),
            "tool" | "function" => Ok(Self::Tool),
            other => Err(LlmError::ParseError(format!("unknown message role: {other}"))),
        }
    }
}

/// One part of a multimodal message body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    /// Inline image as base64 without a `data:` prefix.
    ImageBase64 { data: String, mime_type: String },
    ImageUrl { url: String },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Base64 image; the MIME type is sniffed from the decoded bytes when possible.
    pub fn image_base64(data: impl Into<String>) -> Self {
        let data = data.into();
        let mime_type = crate::utils::mime::sniff_base64_image(&data)
            .unwrap_or_else(|| "image/png".to_string());
        Self::ImageBase64 { data, mime_type }
    }

    pub fn image_url(url: impl Into<String>) -> Self {
        Self::ImageUrl { url: url.into() }
    }
}

/// A chat message.
///
/// `content` always holds the textual body. `parts`, when present, is the
/// ordered multimodal form and takes precedence for adapters that support it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: MessageRole,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parts: Option<Vec<ContentPart>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn with_role(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            parts: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::Assistant, content)
    }

    pub fn assistant_with_tool_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        let mut msg = Self::with_role(MessageRole::Assistant, content);
        msg.tool_calls = Some(calls);
        msg
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut msg = Self::with_role(MessageRole::Tool, content);
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }

    pub fn with_part(mut self, part: ContentPart) -> Self {
        self.parts.get_or_insert_with(Vec::new).push(part);
        self
    }

    pub fn with_image_base64(self, data: impl Into<String>) -> Self {
        self.with_part(ContentPart::image_base64(data))
    }

    pub fn with_image_url(self, url: impl Into<String>) -> Self {
        self.with_part(ContentPart::image_url(url))
    }

    /// Text of the message, joining text parts when `content` is empty.
    pub fn text(&self) -> String {
        if !self.content.is_empty() {
            return self.content.clone();
        }
        self.parts
            .iter()
            .flatten()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn images(&self) -> impl Iterator<Item = &ContentPart> {
        self.parts
            .iter()
            .flatten()
            .filter(|p| !matches!(p, ContentPart::Text { .. }))
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|c| !c.is_empty())
    }
}

/// Check conversation-level invariants before a request is built.
///
/// A tool message must answer a tool call made by an earlier assistant message,
/// and only tool messages may carry a `tool_call_id`.
pub fn validate_messages(messages: &[ChatMessage]) -> Result<(), LlmError> {
    if messages.is_empty() {
        return Err(LlmError::InvalidInput("messages must not be empty".into()));
    }
    let mut seen_call_ids: Vec<&str> = Vec::new();
    for (idx, msg) in messages.iter().enumerate() {
        match msg.role {
            MessageRole::Tool => {
                let Some(id) = msg.tool_call_id.as_deref() else {
                    return Err(LlmError::InvalidInput(format!(
                        "message {idx}: tool message requires tool_call_id"
                    )));
                };
                if !seen_call_ids.contains(&id) {
                    return Err(LlmError::InvalidInput(format!(
                        "message {idx}: tool_call_id '{id}' does not match a prior assistant tool call"
                    )));
                }
            }
            _ if msg.tool_call_id.is_some() => {
                return Err(LlmError::InvalidInput(format!(
                    "message {idx}: tool_call_id is only valid on tool messages"
                )));
            }
            MessageRole::Assistant => {
                for call in msg.tool_calls.iter().flatten() {
                    seen_call_ids.push(call.id.as_str());
                }
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_message_must_reference_prior_call() {
        let call = ToolCall::new("call_1", "lookup", "{}");
        let ok = vec![
            ChatMessage::user("hi"),
            ChatMessage::assistant_with_tool_calls("", vec![call]),
            ChatMessage::tool("call_1", "42"),
        ];
        assert!(validate_messages(&ok).is_ok());

        let orphan = vec![ChatMessage::user("hi"), ChatMessage::tool("call_9", "42")];
        assert!(matches!(
            validate_messages(&orphan),
            Err(LlmError::InvalidInput(_))
        ));
    }

    #[test]
    fn text_falls_back_to_parts() {
        let msg = ChatMessage::user("")
            .with_part(ContentPart::text("a"))
            .with_image_url("https://example.com/x.png")
            .with_part(ContentPart::text("b"));
        assert_eq!(msg.text(), "ab");
        assert_eq!(msg.images().count(), 1);
    }

    #[test]
    fn role_parse_accepts_provider_aliases() {
        assert_eq!(MessageRole::parse("model").unwrap(), MessageRole::Assistant);
        assert!(MessageRole::parse("narrator").is_err());
    }
}
