//! OpenAI chat-completions wire schema.
//!
//! Shared by OpenAI proper, the OpenAI-compatible back-ends (Qwen, Cerebras,
//! OpenRouter) and Ollama's `/v1` dialect.

use serde_json::{Map, Value, json};

use crate::error::LlmError;
use crate::types::{
    ChatMessage, ContentPart, GenerateOptions, MessageRole, ResponseFormat, Tool, ToolCall,
    ToolChoice,
};
use crate::utils::mime::{sniff_base64_image, strip_data_url};

fn image_part(part: &ContentPart) -> Option<Value> {
    let url = match part {
        ContentPart::ImageBase64 { data, mime_type } => {
            format!("data:{mime_type};base64,{}", strip_data_url(data))
        }
        ContentPart::ImageUrl { url } => url.clone(),
        ContentPart::Text { .. } => return None,
    };
    Some(json!({"type": "image_url", "image_url": {"url": url}}))
}

pub fn encode_message(msg: &ChatMessage) -> Value {
    let mut out = Map::new();
    out.insert("role".into(), json!(msg.role.as_str()));

    let text = msg.text();
    let images: Vec<Value> = msg.images().filter_map(image_part).collect();
    let content = if !images.is_empty() {
        let mut parts = Vec::with_capacity(images.len() + 1);
        if !text.is_empty() {
            parts.push(json!({"type": "text", "text": text}));
        }
        parts.extend(images);
        Value::Array(parts)
    } else if text.is_empty() && msg.has_tool_calls() {
        Value::Null
    } else {
        Value::String(text)
    };
    out.insert("content".into(), content);

    if let Some(calls) = msg.tool_calls.as_ref().filter(|c| !c.is_empty()) {
        let calls: Vec<Value> = calls
            .iter()
            .map(|c| {
                json!({
                    "id": c.id,
                    "type": "function",
                    "function": {"name": c.name, "arguments": c.arguments},
                })
            })
            .collect();
        out.insert("tool_calls".into(), Value::Array(calls));
    }
    if let Some(id) = &msg.tool_call_id {
        out.insert("tool_call_id".into(), json!(id));
    }
    Value::Object(out)
}

pub fn encode_messages(messages: &[ChatMessage]) -> Value {
    Value::Array(messages.iter().map(encode_message).collect())
}

fn decode_part(part: &Value) -> Option<ContentPart> {
    match part.get("type").and_then(Value::as_str)? {
        "text" => Some(ContentPart::text(part.get("text")?.as_str()?)),
        "image_url" => {
            let url = part
                .get("image_url")
                .and_then(|u| u.get("url").or(Some(u)))
                .and_then(Value::as_str)?;
            if url.starts_with("data:") {
                let mime_type = sniff_base64_image(url).unwrap_or_else(|| "image/png".into());
                Some(ContentPart::ImageBase64 {
                    data: strip_data_url(url).to_string(),
                    mime_type,
                })
            } else {
                Some(ContentPart::image_url(url))
            }
        }
        _ => None,
    }
}

pub fn decode_message(wire: &Value) -> Result<ChatMessage, LlmError> {
    let role = wire
        .get("role")
        .and_then(Value::as_str)
        .ok_or_else(|| LlmError::ParseError("message without a role".into()))?;
    let role = MessageRole::parse(role)?;

    let (content, parts) = match wire.get("content") {
        Some(Value::String(s)) => (s.clone(), None),
        Some(Value::Array(items)) => {
            let parts: Vec<ContentPart> = items.iter().filter_map(decode_part).collect();
            let text = parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<String>();
            (text, Some(parts))
        }
        _ => (String::new(), None),
    };

    let tool_calls = match wire.get("tool_calls").and_then(Value::as_array) {
        Some(calls) => Some(
            calls
                .iter()
                .map(|c| {
                    let function = c.get("function").unwrap_or(&Value::Null);
                    let arguments = match function.get("arguments") {
                        Some(Value::String(s)) => s.clone(),
                        Some(Value::Null) | None => "{}".to_string(),
                        Some(other) => other.to_string(),
                    };
                    ToolCall::new(
                        c.get("id").and_then(Value::as_str).unwrap_or_default(),
                        function.get("name").and_then(Value::as_str).unwrap_or_default(),
                        arguments,
                    )
                })
                .collect(),
        ),
        None => None,
    };

    Ok(ChatMessage {
        role,
        content,
        parts,
        tool_calls,
        tool_call_id: wire
            .get("tool_call_id")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

pub fn decode_messages(wire: &Value) -> Result<Vec<ChatMessage>, LlmError> {
    wire.as_array()
        .ok_or_else(|| LlmError::ParseError("expected an array of messages".into()))?
        .iter()
        .map(decode_message)
        .collect()
}

pub fn encode_tools(tools: &[Tool]) -> Value {
    Value::Array(
        tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect(),
    )
}

pub fn encode_tool_choice(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Auto => json!("auto"),
        ToolChoice::Required => json!("required"),
        ToolChoice::None => json!("none"),
        ToolChoice::Specific(name) => json!({"type": "function", "function": {"name": name}}),
    }
}

pub fn encode_response_format(format: &ResponseFormat) -> Option<Value> {
    match format {
        ResponseFormat::Unconstrained => None,
        ResponseFormat::Json => Some(json!({"type": "json_object"})),
        ResponseFormat::JsonSchema(schema) => Some(json!({
            "type": "json_schema",
            "json_schema": {"name": "response", "schema": schema, "strict": true},
        })),
    }
}

/// Streaming chat-completions request body.
///
/// `include_usage` asks for the usage block on the last chunk; back-ends
/// that reject `stream_options` can turn it off.
pub fn build_chat_request(model: &str, options: &GenerateOptions, include_usage: bool) -> Value {
    let mut body = Map::new();
    body.insert("model".into(), json!(model));
    body.insert("messages".into(), encode_messages(&options.messages));
    body.insert("stream".into(), json!(true));
    if include_usage {
        body.insert("stream_options".into(), json!({"include_usage": true}));
    }
    if let Some(t) = options.temperature {
        body.insert("temperature".into(), json!(t));
    }
    if let Some(max) = options.max_tokens {
        body.insert("max_tokens".into(), json!(max));
    }
    if !options.stop.is_empty() {
        body.insert("stop".into(), json!(options.stop));
    }
    if !options.tools.is_empty() {
        body.insert("tools".into(), encode_tools(&options.tools));
        body.insert("tool_choice".into(), encode_tool_choice(&options.tool_choice));
    }
    if let Some(format) = encode_response_format(&options.response_format) {
        body.insert("response_format".into(), format);
    }
    Value::Object(body)
}
