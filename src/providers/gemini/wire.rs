//! Gemini `generateContent` schema.

use std::collections::HashMap;

use serde_json::{Map, Value, json};

use crate::error::LlmError;
use crate::types::{
    ChatMessage, ContentPart, GenerateOptions, MessageRole, ResponseFormat, Tool, ToolCall,
    ToolChoice,
};
use crate::utils::mime::{sniff_base64_image, strip_data_url};

fn image_part(part: &ContentPart) -> Option<Value> {
    match part {
        ContentPart::ImageBase64 { data, mime_type } => Some(json!({
            "inlineData": {"mimeType": mime_type, "data": strip_data_url(data)}
        })),
        ContentPart::ImageUrl { url } => {
            let mime = mime_from_url(url);
            Some(json!({"fileData": {"mimeType": mime, "fileUri": url}}))
        }
        ContentPart::Text { .. } => None,
    }
}

fn mime_from_url(url: &str) -> String {
    let lower = url.to_ascii_lowercase();
    let ext = lower.rsplit('.').next().unwrap_or_default();
    match ext {
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "image/png",
    }
    .to_string()
}

fn parse_args(call: &ToolCall) -> Result<Value, LlmError> {
    if call.arguments.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(&call.arguments).map_err(|e| {
        LlmError::InvalidInput(format!(
            "tool call '{}' has arguments that are not JSON: {e}",
            call.id
        ))
    })
}

fn is_function_response_turn(turn: &Value) -> bool {
    turn.get("parts")
        .and_then(Value::as_array)
        .is_some_and(|parts| !parts.is_empty() && parts.iter().all(|p| p.get("functionResponse").is_some()))
}

/// Split into `systemInstruction` text and `contents`.
pub fn encode_conversation(messages: &[ChatMessage]) -> Result<(Option<String>, Vec<Value>), LlmError> {
    let mut system = Vec::new();
    let mut contents: Vec<Value> = Vec::new();
    // Function responses are matched to calls by name.
    let mut call_names: HashMap<String, String> = HashMap::new();

    for msg in messages {
        match msg.role {
            MessageRole::System => system.push(msg.text()),
            MessageRole::Tool => {
                let id = msg.tool_call_id.clone().unwrap_or_default();
                let name = call_names.get(&id).cloned().unwrap_or_else(|| id.clone());
                let part = json!({
                    "functionResponse": {
                        "id": id,
                        "name": name,
                        "response": {"content": msg.text()},
                    }
                });
                match contents.last_mut() {
                    Some(last) if is_function_response_turn(last) => {
                        if let Some(parts) = last["parts"].as_array_mut() {
                            parts.push(part);
                        }
                    }
                    _ => contents.push(json!({"role": "user", "parts": [part]})),
                }
            }
            MessageRole::User | MessageRole::Assistant => {
                let mut parts = Vec::new();
                let text = msg.text();
                if !text.is_empty() {
                    parts.push(json!({"text": text}));
                }
                parts.extend(msg.images().filter_map(image_part));
                for call in msg.tool_calls.as_deref().unwrap_or_default() {
                    call_names.insert(call.id.clone(), call.name.clone());
                    parts.push(json!({
                        "functionCall": {"id": call.id, "name": call.name, "args": parse_args(call)?}
                    }));
                }
                if parts.is_empty() {
                    parts.push(json!({"text": ""}));
                }
                let role = if msg.role == MessageRole::Assistant { "model" } else { "user" };
                contents.push(json!({"role": role, "parts": parts}));
            }
        }
    }
    let system = (!system.is_empty()).then(|| system.join("\n\n"));
    Ok((system, contents))
}

/// Wire history as `{systemInstruction?, contents}`.
pub fn encode_messages(messages: &[ChatMessage]) -> Result<Value, LlmError> {
    let (system, contents) = encode_conversation(messages)?;
    let mut out = Map::new();
    if let Some(system) = system {
        out.insert("systemInstruction".into(), json!({"parts": [{"text": system}]}));
    }
    out.insert("contents".into(), Value::Array(contents));
    Ok(Value::Object(out))
}

fn parts_text(parts: &[Value]) -> String {
    parts
        .iter()
        .filter(|p| !p.get("thought").and_then(Value::as_bool).unwrap_or(false))
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect()
}

fn decode_content(content: &Value, out: &mut Vec<ChatMessage>) -> Result<(), LlmError> {
    let parts = content
        .get("parts")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    if is_function_response_turn(content) {
        for part in parts {
            let resp = &part["functionResponse"];
            let id = resp
                .get("id")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .or_else(|| resp.get("name").and_then(Value::as_str))
                .unwrap_or_default();
            let body = resp.get("response").unwrap_or(&Value::Null);
            let text = match body.get("content") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => body.to_string(),
            };
            out.push(ChatMessage::tool(id, text));
        }
        return Ok(());
    }

    let role = match content.get("role").and_then(Value::as_str) {
        Some("model") => MessageRole::Assistant,
        Some("user") | None => MessageRole::User,
        Some(other) => MessageRole::parse(other)?,
    };
    let mut msg = ChatMessage {
        role,
        content: parts_text(parts),
        parts: None,
        tool_calls: None,
        tool_call_id: None,
    };
    let mut calls = Vec::new();
    for part in parts {
        if let Some(inline) = part.get("inlineData") {
            let data = inline.get("data").and_then(Value::as_str).unwrap_or_default();
            let mime_type = inline
                .get("mimeType")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| sniff_base64_image(data))
                .unwrap_or_else(|| "image/png".into());
            msg = msg.with_part(ContentPart::ImageBase64 {
                data: data.to_string(),
                mime_type,
            });
        } else if let Some(file) = part.get("fileData") {
            msg = msg.with_part(ContentPart::image_url(
                file.get("fileUri").and_then(Value::as_str).unwrap_or_default(),
            ));
        } else if let Some(call) = part.get("functionCall") {
            let name = call.get("name").and_then(Value::as_str).unwrap_or_default();
            let id = call
                .get("id")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("call_{}", calls.len()));
            let args = call.get("args").map_or_else(|| "{}".to_string(), Value::to_string);
            calls.push(ToolCall::new(id, name, args));
        }
    }
    if !calls.is_empty() {
        msg.tool_calls = Some(calls);
    }
    out.push(msg);
    Ok(())
}

/// Accepts `{systemInstruction?, contents}` or a bare contents array.
pub fn decode_messages(wire: &Value) -> Result<Vec<ChatMessage>, LlmError> {
    let mut out = Vec::new();
    let contents = match wire {
        Value::Array(items) => items.as_slice(),
        Value::Object(obj) => {
            if let Some(system) = obj.get("systemInstruction") {
                let parts = system
                    .get("parts")
                    .and_then(Value::as_array)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                out.push(ChatMessage::system(parts_text(parts)));
            }
            obj.get("contents")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default()
        }
        _ => return Err(LlmError::ParseError("expected contents".into())),
    };
    for content in contents {
        decode_content(content, &mut out)?;
    }
    Ok(out)
}

pub fn encode_tools(tools: &[Tool]) -> Value {
    let decls: Vec<Value> = tools
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description,
                "parameters": t.parameters,
            })
        })
        .collect();
    json!([{"functionDeclarations": decls}])
}

pub fn encode_tool_config(choice: &ToolChoice) -> Value {
    let config = match choice {
        ToolChoice::Auto => json!({"mode": "AUTO"}),
        ToolChoice::Required => json!({"mode": "ANY"}),
        ToolChoice::None => json!({"mode": "NONE"}),
        ToolChoice::Specific(name) => json!({"mode": "ANY", "allowedFunctionNames": [name]}),
    };
    json!({"functionCallingConfig": config})
}

pub fn build_chat_request(options: &GenerateOptions) -> Result<Value, LlmError> {
    let (system, contents) = encode_conversation(&options.messages)?;
    let mut body = Map::new();
    body.insert("contents".into(), Value::Array(contents));
    if let Some(system) = system {
        body.insert("systemInstruction".into(), json!({"parts": [{"text": system}]}));
    }

    let mut generation = Map::new();
    if let Some(t) = options.temperature {
        generation.insert("temperature".into(), json!(t));
    }
    if let Some(n) = options.max_tokens {
        generation.insert("maxOutputTokens".into(), json!(n));
    }
    if !options.stop.is_empty() {
        generation.insert("stopSequences".into(), json!(options.stop));
    }
    match &options.response_format {
        ResponseFormat::Unconstrained => {}
        ResponseFormat::Json => {
            generation.insert("responseMimeType".into(), json!("application/json"));
        }
        ResponseFormat::JsonSchema(schema) => {
            generation.insert("responseMimeType".into(), json!("application/json"));
            generation.insert("responseSchema".into(), schema.clone());
        }
    }
    if !generation.is_empty() {
        body.insert("generationConfig".into(), Value::Object(generation));
    }
    if !options.tools.is_empty() {
        body.insert("tools".into(), encode_tools(&options.tools));
        body.insert("toolConfig".into(), encode_tool_config(&options.tool_choice));
    }
    Ok(Value::Object(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_and_function_responses() {
        let msgs = vec![
            ChatMessage::system("sys"),
            ChatMessage::user("hi"),
            ChatMessage::assistant_with_tool_calls(
                "",
                vec![ToolCall::new("c1", "lookup", r#"{"q":"x"}"#)],
            ),
            ChatMessage::tool("c1", "found"),
        ];
        let (system, contents) = encode_conversation(&msgs).unwrap();
        assert_eq!(system.as_deref(), Some("sys"));
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[1]["parts"][0]["functionCall"]["args"]["q"], "x");
        assert_eq!(contents[2]["parts"][0]["functionResponse"]["name"], "lookup");

        let back = decode_messages(&encode_messages(&msgs).unwrap()).unwrap();
        assert_eq!(back.len(), 4);
        assert_eq!(back[2].role, MessageRole::Assistant);
        assert_eq!(back[3].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(back[3].text(), "found");
    }

    #[test]
    fn schema_goes_to_generation_config() {
        let opts = GenerateOptions::new("gemini")
            .message(ChatMessage::user("hi"))
            .response_format(ResponseFormat::JsonSchema(json!({"type": "object"})));
        let body = build_chat_request(&opts).unwrap();
        assert_eq!(body["generationConfig"]["responseMimeType"], "application/json");
        assert_eq!(body["generationConfig"]["responseSchema"]["type"], "object");
    }

    #[test]
    fn specific_tool_choice_restricts_names() {
        let cfg = encode_tool_config(&ToolChoice::Specific("f".into()));
        assert_eq!(cfg["functionCallingConfig"]["mode"], "ANY");
        assert_eq!(cfg["functionCallingConfig"]["allowedFunctionNames"][0], "f");
    }

    #[test]
    fn image_url_becomes_file_data() {
        let msg = ChatMessage::user("look").with_image_url("https://x/cat.JPG");
        let (_, contents) = encode_conversation(&[msg]).unwrap();
        assert_eq!(contents[0]["parts"][1]["fileData"]["mimeType"], "image/jpeg");
    }
}
