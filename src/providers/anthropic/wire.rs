//! Anthropic Messages API schema.
//!
//! System prompts travel outside the message list. Tool results are user
//! turns made of `tool_result` blocks; consecutive results share one turn.

use serde_json::{Map, Value, json};

use crate::error::LlmError;
use crate::types::{
    ChatMessage, ContentPart, GenerateOptions, MessageRole, ResponseFormat, Tool, ToolCall,
    ToolChoice,
};
use crate::utils::mime::strip_data_url;

pub const DEFAULT_MAX_TOKENS: u32 = 4096;

fn image_block(part: &ContentPart) -> Option<Value> {
    match part {
        ContentPart::ImageBase64 { data, mime_type } => Some(json!({
            "type": "image",
            "source": {"type": "base64", "media_type": mime_type, "data": strip_data_url(data)},
        })),
        ContentPart::ImageUrl { url } => Some(json!({
            "type": "image",
            "source": {"type": "url", "url": url},
        })),
        ContentPart::Text { .. } => None,
    }
}

fn tool_input(call: &ToolCall) -> Result<Value, LlmError> {
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

fn is_tool_result_turn(turn: &Value) -> bool {
    turn.get("role").and_then(Value::as_str) == Some("user")
        && turn
            .get("content")
            .and_then(Value::as_array)
            .is_some_and(|blocks| {
                !blocks.is_empty()
                    && blocks
                        .iter()
                        .all(|b| b.get("type").and_then(Value::as_str) == Some("tool_result"))
            })
}

/// Split into the system prompt and the `messages` array.
pub fn encode_conversation(messages: &[ChatMessage]) -> Result<(Option<String>, Vec<Value>), LlmError> {
    let mut system = Vec::new();
    let mut turns: Vec<Value> = Vec::new();
    for msg in messages {
        match msg.role {
            MessageRole::System => system.push(msg.text()),
            MessageRole::Tool => {
                let block = json!({
                    "type": "tool_result",
                    "tool_use_id": msg.tool_call_id.clone().unwrap_or_default(),
                    "content": msg.text(),
                });
                match turns.last_mut() {
                    Some(last) if is_tool_result_turn(last) => {
                        if let Some(blocks) = last["content"].as_array_mut() {
                            blocks.push(block);
                        }
                    }
                    _ => turns.push(json!({"role": "user", "content": [block]})),
                }
            }
            MessageRole::User | MessageRole::Assistant => {
                let text = msg.text();
                let images: Vec<Value> = msg.images().filter_map(image_block).collect();
                let calls = msg.tool_calls.as_deref().unwrap_or_default();
                let content = if images.is_empty() && calls.is_empty() {
                    Value::String(text)
                } else {
                    let mut blocks = Vec::new();
                    if !text.is_empty() {
                        blocks.push(json!({"type": "text", "text": text}));
                    }
                    blocks.extend(images);
                    for call in calls {
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": call.id,
                            "name": call.name,
                            "input": tool_input(call)?,
                        }));
                    }
                    Value::Array(blocks)
                };
                turns.push(json!({"role": msg.role.as_str(), "content": content}));
            }
        }
    }
    let system = (!system.is_empty()).then(|| system.join("\n\n"));
    Ok((system, turns))
}

/// Wire history as `{system?, messages}`.
pub fn encode_messages(messages: &[ChatMessage]) -> Result<Value, LlmError> {
    let (system, turns) = encode_conversation(messages)?;
    let mut out = Map::new();
    if let Some(system) = system {
        out.insert("system".into(), json!(system));
    }
    out.insert("messages".into(), Value::Array(turns));
    Ok(Value::Object(out))
}

fn block_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect(),
        _ => String::new(),
    }
}

fn decode_turn(turn: &Value, out: &mut Vec<ChatMessage>) -> Result<(), LlmError> {
    let role = turn
        .get("role")
        .and_then(Value::as_str)
        .ok_or_else(|| LlmError::ParseError("turn without a role".into()))?;
    let role = MessageRole::parse(role)?;
    let content = turn.get("content").unwrap_or(&Value::Null);

    if is_tool_result_turn(turn) {
        for block in content.as_array().into_iter().flatten() {
            out.push(ChatMessage::tool(
                block.get("tool_use_id").and_then(Value::as_str).unwrap_or_default(),
                block_text(block.get("content").unwrap_or(&Value::Null)),
            ));
        }
        return Ok(());
    }

    let mut msg = ChatMessage {
        role,
        content: block_text(content),
        parts: None,
        tool_calls: None,
        tool_call_id: None,
    };
    let mut calls = Vec::new();
    for block in content.as_array().into_iter().flatten() {
        match block.get("type").and_then(Value::as_str) {
            Some("image") => {
                let source = block.get("source").unwrap_or(&Value::Null);
                let part = match source.get("type").and_then(Value::as_str) {
                    Some("url") => ContentPart::image_url(
                        source.get("url").and_then(Value::as_str).unwrap_or_default(),
                    ),
                    _ => ContentPart::ImageBase64 {
                        data: source
                            .get("data")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        mime_type: source
                            .get("media_type")
                            .and_then(Value::as_str)
                            .unwrap_or("image/png")
                            .to_string(),
                    },
                };
                msg = msg.with_part(part);
            }
            Some("tool_use") => calls.push(ToolCall::new(
                block.get("id").and_then(Value::as_str).unwrap_or_default(),
                block.get("name").and_then(Value::as_str).unwrap_or_default(),
                block.get("input").map_or_else(|| "{}".to_string(), Value::to_string),
            )),
            _ => {}
        }
    }
    if !calls.is_empty() {
        msg.tool_calls = Some(calls);
    }
    out.push(msg);
    Ok(())
}

/// Accepts `{system?, messages}` or a bare message array.
pub fn decode_messages(wire: &Value) -> Result<Vec<ChatMessage>, LlmError> {
    let mut out = Vec::new();
    let turns = match wire {
        Value::Array(turns) => turns.as_slice(),
        Value::Object(obj) => {
            if let Some(system) = obj.get("system") {
                out.push(ChatMessage::system(block_text(system)));
            }
            obj.get("messages")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default()
        }
        _ => return Err(LlmError::ParseError("expected messages".into())),
    };
    for turn in turns {
        decode_turn(turn, &mut out)?;
    }
    Ok(out)
}

pub fn encode_tools(tools: &[Tool]) -> Value {
    Value::Array(
        tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                })
            })
            .collect(),
    )
}

pub fn encode_tool_choice(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Auto => json!({"type": "auto"}),
        ToolChoice::Required => json!({"type": "any"}),
        ToolChoice::None => json!({"type": "none"}),
        ToolChoice::Specific(name) => json!({"type": "tool", "name": name}),
    }
}

/// The Messages API has no JSON mode, so the constraint becomes an instruction.
fn format_instruction(format: &ResponseFormat) -> Option<String> {
    match format {
        ResponseFormat::Unconstrained => None,
        ResponseFormat::Json => {
            Some("Respond only with a single valid JSON value and no other text.".into())
        }
        ResponseFormat::JsonSchema(schema) => Some(format!(
            "Respond only with JSON that validates against this JSON schema and no other text:\n{schema}"
        )),
    }
}

pub fn build_chat_request(model: &str, options: &GenerateOptions) -> Result<Value, LlmError> {
    let (system, turns) = encode_conversation(&options.messages)?;
    let system = match (system, format_instruction(&options.response_format)) {
        (Some(s), Some(i)) => Some(format!("{s}\n\n{i}")),
        (s, i) => s.or(i),
    };

    let mut body = Map::new();
    body.insert("model".into(), json!(model));
    body.insert(
        "max_tokens".into(),
        json!(options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
    );
    if let Some(system) = system {
        body.insert("system".into(), json!(system));
    }
    body.insert("messages".into(), Value::Array(turns));
    body.insert("stream".into(), json!(true));
    if let Some(t) = options.temperature {
        body.insert("temperature".into(), json!(t));
    }
    if !options.stop.is_empty() {
        body.insert("stop_sequences".into(), json!(options.stop));
    }
    if !options.tools.is_empty() {
        body.insert("tools".into(), encode_tools(&options.tools));
        body.insert("tool_choice".into(), encode_tool_choice(&options.tool_choice));
    }
    Ok(Value::Object(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_is_lifted_and_tool_results_grouped() {
        let msgs = vec![
            ChatMessage::system("be brief"),
            ChatMessage::user("weather in SF and NYC?"),
            ChatMessage::assistant_with_tool_calls(
                "",
                vec![
                    ToolCall::new("t1", "get_weather", r#"{"city":"SF"}"#),
                    ToolCall::new("t2", "get_weather", r#"{"city":"NYC"}"#),
                ],
            ),
            ChatMessage::tool("t1", "sunny"),
            ChatMessage::tool("t2", "rain"),
        ];
        let (system, turns) = encode_conversation(&msgs).unwrap();
        assert_eq!(system.as_deref(), Some("be brief"));
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[1]["content"][0]["type"], "tool_use");
        assert_eq!(turns[1]["content"][0]["input"]["city"], "SF");
        assert_eq!(turns[2]["content"].as_array().unwrap().len(), 2);

        let back = decode_messages(&encode_messages(&msgs).unwrap()).unwrap();
        assert_eq!(back.len(), msgs.len());
        assert_eq!(back[3].tool_call_id.as_deref(), Some("t1"));
        assert_eq!(back[4].text(), "rain");
        assert_eq!(back[2].tool_calls.as_ref().unwrap()[1].arguments, r#"{"city":"NYC"}"#);
    }

    #[test]
    fn schema_becomes_system_instruction() {
        let opts = GenerateOptions::new("claude")
            .message(ChatMessage::system("sys"))
            .message(ChatMessage::user("hi"))
            .response_format(ResponseFormat::JsonSchema(json!({"type": "object"})));
        let body = build_chat_request("claude", &opts).unwrap();
        let system = body["system"].as_str().unwrap();
        assert!(system.starts_with("sys"));
        assert!(system.contains(r#"{"type":"object"}"#));
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn required_choice_maps_to_any() {
        assert_eq!(encode_tool_choice(&ToolChoice::Required), json!({"type": "any"}));
    }

    #[test]
    fn non_json_arguments_are_rejected() {
        let msgs = vec![ChatMessage::assistant_with_tool_calls(
            "",
            vec![ToolCall::new("t", "f", "{broken")],
        )];
        assert!(encode_conversation(&msgs).is_err());
    }
}
