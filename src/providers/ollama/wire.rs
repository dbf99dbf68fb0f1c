//! Ollama native `/api/chat` schema.

use serde_json::{Map, Value, json};

use crate::error::LlmError;
use crate::types::{
    ChatMessage, ContentPart, GenerateOptions, MessageRole, ResponseFormat, Tool, ToolCall,
};
use crate::utils::mime::{sniff_base64_image, strip_data_url};

/// Model names must be non-blank.
pub fn validate_model_name(model: &str) -> Result<(), LlmError> {
    if model.trim().is_empty() {
        return Err(LlmError::InvalidInput("model name must not be empty".into()));
    }
    Ok(())
}

/// Native messages carry images as bare base64 strings. URLs are refused
/// rather than fetched.
pub fn encode_message(msg: &ChatMessage) -> Result<Value, LlmError> {
    let mut out = Map::new();
    out.insert("role".into(), json!(msg.role.as_str()));
    out.insert("content".into(), json!(msg.text()));

    let mut images = Vec::new();
    for part in msg.images() {
        match part {
            ContentPart::ImageBase64 { data, .. } => images.push(json!(strip_data_url(data))),
            ContentPart::ImageUrl { url } => {
                return Err(LlmError::InvalidInput(format!(
                    "the native Ollama endpoint accepts only base64 images, got URL {url}"
                )));
            }
            ContentPart::Text { .. } => {}
        }
    }
    if !images.is_empty() {
        out.insert("images".into(), Value::Array(images));
    }

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
    Ok(Value::Object(out))
}

pub fn encode_messages(messages: &[ChatMessage]) -> Result<Value, LlmError> {
    messages
        .iter()
        .map(encode_message)
        .collect::<Result<Vec<_>, _>>()
        .map(Value::Array)
}

/// Arguments arrive either as an object or as a serialized string.
pub(crate) fn arguments_string(args: Option<&Value>) -> String {
    match args {
        Some(Value::String(s)) if s.trim().is_empty() => "{}".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => "{}".to_string(),
        Some(other) => other.to_string(),
    }
}

pub fn decode_message(wire: &Value) -> Result<ChatMessage, LlmError> {
    let role = wire
        .get("role")
        .and_then(Value::as_str)
        .ok_or_else(|| LlmError::ParseError("message without a role".into()))?;
    let mut msg = ChatMessage {
        role: MessageRole::parse(role)?,
        content: wire
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        parts: None,
        tool_calls: None,
        tool_call_id: wire
            .get("tool_call_id")
            .and_then(Value::as_str)
            .map(str::to_string),
    };
    for image in wire
        .get("images")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
    {
        let mime_type = sniff_base64_image(image).unwrap_or_else(|| "image/png".into());
        msg = msg.with_part(ContentPart::ImageBase64 {
            data: image.to_string(),
            mime_type,
        });
    }
    if let Some(calls) = wire.get("tool_calls").and_then(Value::as_array) {
        msg.tool_calls = Some(
            calls
                .iter()
                .enumerate()
                .map(|(i, c)| {
                    let function = c.get("function").unwrap_or(&Value::Null);
                    ToolCall::new(
                        c.get("id")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                            .unwrap_or_else(|| format!("call_{i}")),
                        function.get("name").and_then(Value::as_str).unwrap_or_default(),
                        arguments_string(function.get("arguments")),
                    )
                })
                .collect(),
        );
    }
    Ok(msg)
}

pub fn decode_messages(wire: &Value) -> Result<Vec<ChatMessage>, LlmError> {
    wire.as_array()
        .ok_or_else(|| LlmError::ParseError("expected an array of messages".into()))?
        .iter()
        .map(decode_message)
        .collect()
}

pub fn encode_tool(tool: &Tool) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

/// The `format` field: `"json"` for JSON mode, the schema object itself for
/// structured output, absent otherwise.
pub fn encode_format(format: &ResponseFormat) -> Option<Value> {
    match format {
        ResponseFormat::Unconstrained => None,
        ResponseFormat::Json => Some(json!("json")),
        ResponseFormat::JsonSchema(schema) => Some(schema.clone()),
    }
}

pub fn build_chat_request(model: &str, options: &GenerateOptions) -> Result<Value, LlmError> {
    validate_model_name(model)?;
    let mut body = Map::new();
    body.insert("model".into(), json!(model));
    body.insert("messages".into(), encode_messages(&options.messages)?);
    body.insert("stream".into(), json!(true));
    if !options.tools.is_empty() {
        body.insert(
            "tools".into(),
            Value::Array(options.tools.iter().map(encode_tool).collect()),
        );
    }
    if let Some(format) = encode_format(&options.response_format) {
        body.insert("format".into(), format);
    }

    let mut model_options = Map::new();
    if let Some(t) = options.temperature {
        model_options.insert("temperature".into(), json!(t));
    }
    if let Some(n) = options.max_tokens {
        model_options.insert("num_predict".into(), json!(n));
    }
    if !options.stop.is_empty() {
        model_options.insert("stop".into(), json!(options.stop));
    }
    if !model_options.is_empty() {
        body.insert("options".into(), Value::Object(model_options));
    }
    Ok(Value::Object(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_mode_sends_the_string() {
        let opts = GenerateOptions::new("llama3")
            .message(ChatMessage::user("hi"))
            .response_format_raw("json");
        let body = build_chat_request("llama3", &opts).unwrap();
        assert_eq!(body["format"], json!("json"));
    }

    #[test]
    fn schema_string_is_sent_as_object() {
        let schema = r#"{"type":"object","properties":{"name":{"type":"string"}}}"#;
        let opts = GenerateOptions::new("llama3")
            .message(ChatMessage::user("hi"))
            .response_format_raw(schema);
        let body = build_chat_request("llama3", &opts).unwrap();
        assert_eq!(body["format"]["properties"]["name"]["type"], "string");
    }

    #[test]
    fn unconstrained_omits_format_and_empty_options() {
        let opts = GenerateOptions::new("llama3").message(ChatMessage::user("hi"));
        let body = build_chat_request("llama3", &opts).unwrap();
        assert!(body.get("format").is_none());
        assert!(body.get("options").is_none());
    }

    #[test]
    fn sampling_options_nest_under_options() {
        let opts = GenerateOptions::new("m")
            .message(ChatMessage::user("hi"))
            .temperature(0.2)
            .max_tokens(64)
            .stop("END");
        let body = build_chat_request("m", &opts).unwrap();
        assert_eq!(body["options"]["num_predict"], 64);
        assert_eq!(body["options"]["stop"], json!(["END"]));
    }

    #[test]
    fn image_urls_are_rejected() {
        let msg = ChatMessage::user("what is this").with_image_url("https://x/cat.png");
        let err = encode_message(&msg).unwrap_err();
        assert!(matches!(err, LlmError::InvalidInput(_)));
    }

    #[test]
    fn base64_images_travel_in_images_array() {
        let msg = ChatMessage::user("what is this").with_image_base64("data:image/png;base64,AAAA");
        let wire = encode_message(&msg).unwrap();
        assert_eq!(wire["images"], json!(["AAAA"]));
        let back = decode_message(&wire).unwrap();
        assert_eq!(back.images().count(), 1);
        assert_eq!(back.text(), "what is this");
    }

    #[test]
    fn object_arguments_are_serialized() {
        let wire = json!({
            "role": "assistant",
            "content": "",
            "tool_calls": [{"function": {"name": "f", "arguments": {"b": 1, "a": "x"}}}]
        });
        let msg = decode_message(&wire).unwrap();
        let call = &msg.tool_calls.unwrap()[0];
        assert_eq!(call.id, "call_0");
        assert_eq!(call.arguments, r#"{"a":"x","b":1}"#);
    }

    #[test]
    fn blank_model_rejected() {
        assert!(build_chat_request("  ", &GenerateOptions::new("")).is_err());
    }
}
