//! Gemini `streamGenerateContent?alt=sse` translation.
//!
//! Each event is a full `GenerateContentResponse`. Function calls arrive
//! whole, never fragmented.

use serde::Deserialize;
use serde_json::Value;

use crate::error::LlmError;
use crate::streaming::{StreamEvent, StreamTranslator, ToolCallAccumulator};
use crate::types::{ChatCompletionChunk, ToolCall, Usage, normalize_finish_reason};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Response {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    model_version: Option<String>,
    #[serde(default)]
    response_id: Option<String>,
    #[serde(default)]
    error: Option<WireError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thought: bool,
    #[serde(default)]
    function_call: Option<FunctionCall>,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(default)]
    args: Option<Value>,
}

#[derive(Debug, Default, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: Option<String>,
}

impl WireError {
    fn into_error(self) -> LlmError {
        match (self.code, self.status.as_deref()) {
            (Some(401 | 403), _) | (_, Some("UNAUTHENTICATED" | "PERMISSION_DENIED")) => {
                LlmError::AuthenticationError(self.message)
            }
            (Some(429), _) | (_, Some("RESOURCE_EXHAUSTED")) => {
                LlmError::rate_limited(self.message, None)
            }
            (Some(code), _) => LlmError::api_error(code, self.message),
            (None, _) => LlmError::api_error(500, self.message),
        }
    }
}

#[derive(Debug, Default)]
pub struct GeminiTranslator {
    id: String,
    model: String,
    tools: ToolCallAccumulator,
    usage: Option<Usage>,
    finish_reason: Option<String>,
    done: bool,
}

impl GeminiTranslator {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: format!("gemini-{}", uuid::Uuid::new_v4().simple()),
            model: model.into(),
            ..Default::default()
        }
    }

    fn terminal(&mut self) -> Result<ChatCompletionChunk, LlmError> {
        self.done = true;
        let calls = self.tools.finish()?;
        let reason = match self.finish_reason.as_deref() {
            Some("stop") | None if !calls.is_empty() => "tool_calls".to_string(),
            Some(r) => r.to_string(),
            None => String::new(),
        };
        Ok(ChatCompletionChunk::terminal(self.id.clone(), self.model.clone(), reason)
            .with_usage(self.usage)
            .with_assembled_tool_calls(&calls))
    }
}

impl StreamTranslator for GeminiTranslator {
    fn translate(&mut self, event: &StreamEvent) -> Result<Vec<ChatCompletionChunk>, LlmError> {
        if self.done || event.data.trim().is_empty() {
            return Ok(Vec::new());
        }
        let resp: Response = serde_json::from_str(&event.data)
            .map_err(|e| LlmError::ParseError(format!("malformed Gemini frame: {e}")))?;
        if let Some(err) = resp.error {
            return Err(err.into_error());
        }
        if let Some(id) = resp.response_id {
            self.id = id;
        }
        if let Some(model) = resp.model_version {
            self.model = model;
        }
        if let Some(u) = resp.usage_metadata {
            self.usage = Some(Usage::new(u.prompt_token_count, u.candidates_token_count));
        }

        let mut out = Vec::new();
        let Some(candidate) = resp.candidates.into_iter().next() else {
            return Ok(out);
        };
        for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
            if let Some(call) = part.function_call {
                let id = call
                    .id
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| format!("call_{}", self.tools.len()));
                let args = call.args.map_or_else(|| "{}".to_string(), |v| v.to_string());
                self.tools.push_complete(ToolCall::new(id, call.name, args));
            } else if let Some(text) = part.text
                && !part.thought
                && !text.is_empty()
            {
                out.push(ChatCompletionChunk::content(self.id.clone(), self.model.clone(), text));
            }
        }
        if let Some(reason) = candidate.finish_reason {
            self.finish_reason = Some(normalize_finish_reason(&reason).to_string());
            out.push(self.terminal()?);
        }
        Ok(out)
    }

    fn finish(&mut self) -> Result<Vec<ChatCompletionChunk>, LlmError> {
        if self.done || (self.finish_reason.is_none() && self.tools.is_empty()) {
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

    fn run(frames: &[&str]) -> Vec<ChatCompletionChunk> {
        let mut t = GeminiTranslator::new("gemini-1.5-flash");
        let mut out: Vec<_> = frames
            .iter()
            .flat_map(|f| t.translate(&StreamEvent::message(*f)).unwrap())
            .collect();
        out.extend(t.finish().unwrap());
        out
    }

    #[test]
    fn text_then_finish_with_usage() {
        let chunks = run(&[
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hel"}]}}]}"#,
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"lo"}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":4,"candidatesTokenCount":2,"totalTokenCount":6}}"#,
        ]);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1].text(), "lo");
        let last = &chunks[2];
        assert!(last.done);
        assert_eq!(last.finish_reason, "stop");
        assert_eq!(last.usage, Some(Usage::new(4, 2)));
    }

    #[test]
    fn function_calls_force_tool_calls_reason() {
        let chunks = run(&[
            r#"{"candidates":[{"content":{"parts":[{"functionCall":{"name":"get_weather","args":{"city":"SF"}}}]},"finishReason":"STOP"}]}"#,
        ]);
        let last = chunks.last().unwrap();
        assert_eq!(last.finish_reason, "tool_calls");
        let calls = last.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].id.as_deref(), Some("call_0"));
        assert_eq!(calls[0].arguments, r#"{"city":"SF"}"#);
    }

    #[test]
    fn thoughts_are_not_content() {
        let chunks = run(&[
            r#"{"candidates":[{"content":{"parts":[{"text":"hmm","thought":true},{"text":"ok"}]},"finishReason":"STOP"}]}"#,
        ]);
        assert_eq!(chunks[0].text(), "ok");
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn error_frame_maps_status() {
        let mut t = GeminiTranslator::new("g");
        let err = t
            .translate(&StreamEvent::message(
                r#"{"error":{"code":429,"message":"quota","status":"RESOURCE_EXHAUSTED"}}"#,
            ))
            .unwrap_err();
        assert!(matches!(err, LlmError::RateLimitError { .. }));
    }
}
