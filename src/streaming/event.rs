//! Decoded transport events and format tags.

use bytes::Bytes;

/// One event produced by a stream decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    /// Defaults to `message` when the transport names no type.
    pub event_type: String,
    pub data: String,
    /// Last event id seen on the stream (persists across events).
    pub id: Option<String>,
    /// Last reconnection hint in milliseconds (persists across events).
    pub retry: Option<u64>,
    pub raw: Bytes,
}

impl StreamEvent {
    pub fn message(data: impl Into<String>) -> Self {
        let data = data.into();
        Self {
            event_type: "message".to_string(),
            raw: Bytes::from(data.clone().into_bytes()),
            data,
            id: None,
            retry: None,
        }
    }

    pub fn is_done_sentinel(&self) -> bool {
        self.data.trim() == "[DONE]"
    }

    pub fn json(&self) -> Result<serde_json::Value, crate::error::LlmError> {
        serde_json::from_str(&self.data).map_err(|e| {
            crate::error::LlmError::ParseError(format!(
                "malformed JSON event ({e}): {}",
                self.data.chars().take(120).collect::<String>()
            ))
        })
    }
}

/// Transport framing tag used to pick a decoder.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamFormat {
    Sse,
    Ndjson,
    /// `application/stream+json`: one JSON value per line.
    JsonStream,
    Custom(String),
}

impl StreamFormat {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Sse => "sse",
            Self::Ndjson => "ndjson",
            Self::JsonStream => "json-stream",
            Self::Custom(name) => name,
        }
    }
}

impl std::fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
