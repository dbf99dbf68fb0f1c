//! Stream format detection from `Content-Type`, falling back to the first bytes.

use tokio::io::AsyncBufReadExt;

use super::decoder::ByteReader;
use super::event::StreamFormat;
use crate::error::LlmError;

/// Classify a `Content-Type` value. `None` when it says nothing useful.
pub fn format_from_content_type(content_type: &str) -> Option<StreamFormat> {
    let ct = content_type.to_ascii_lowercase();
    let essence = ct.split(';').next().unwrap_or("").trim();
    match essence {
        "text/event-stream" => return Some(StreamFormat::Sse),
        "application/x-ndjson" | "application/jsonlines" | "application/ndjson" => {
            return Some(StreamFormat::Ndjson);
        }
        "application/stream+json" => return Some(StreamFormat::JsonStream),
        _ => {}
    }
    if ct.contains("event-stream") {
        Some(StreamFormat::Sse)
    } else if ct.contains("ndjson") || ct.contains("jsonl") {
        Some(StreamFormat::Ndjson)
    } else {
        None
    }
}

/// Classify a prefix of the body.
pub fn format_from_prefix(prefix: &[u8]) -> Option<StreamFormat> {
    let text = String::from_utf8_lossy(prefix);
    let text = text.trim_start_matches('\u{feff}');
    let mut saw_json_line = false;
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if line.starts_with(':')
            || ["event:", "data:", "id:", "retry:"]
                .iter()
                .any(|f| line.starts_with(f))
        {
            return Some(StreamFormat::Sse);
        }
        let closes = (line.starts_with('{') && line.ends_with('}'))
            || (line.starts_with('[') && line.ends_with(']'));
        if closes {
            saw_json_line = true;
        } else {
            break;
        }
    }
    saw_json_line.then_some(StreamFormat::Ndjson)
}

/// Detect the framing of a response. Peeks at buffered bytes without
/// consuming them, so the same reader can be handed to the decoder.
pub async fn detect_format(
    content_type: Option<&str>,
    reader: &mut ByteReader,
) -> Result<Option<StreamFormat>, LlmError> {
    if let Some(fmt) = content_type.and_then(format_from_content_type) {
        return Ok(Some(fmt));
    }
    let buf = reader
        .fill_buf()
        .await
        .map_err(|e| LlmError::HttpError(format!("stream read failed: {e}")))?;
    Ok(format_from_prefix(buf))
}
