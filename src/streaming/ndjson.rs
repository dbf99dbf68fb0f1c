//! Newline-delimited JSON decoder.
//!
//! One JSON value per line. Blank lines are skipped. A line that does not
//! parse yields `LlmError::ParseError` after being consumed, so the caller can
//! skip it and keep reading.

use async_trait::async_trait;
use bytes::Bytes;

use super::decoder::{ByteReader, StreamDecoder, read_line_bytes};
use super::event::{StreamEvent, StreamFormat};
use crate::error::LlmError;

#[derive(Debug)]
pub struct NdjsonDecoder {
    format: StreamFormat,
    line_buf: Vec<u8>,
}

impl Default for NdjsonDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self {
            format: StreamFormat::Ndjson,
            line_buf: Vec::new(),
        }
    }

    /// Same framing, reported as `application/stream+json`.
    pub fn json_stream() -> Self {
        Self {
            format: StreamFormat::JsonStream,
            line_buf: Vec::new(),
        }
    }
}

#[async_trait]
impl StreamDecoder for NdjsonDecoder {
    async fn decode(&mut self, reader: &mut ByteReader) -> Result<Option<StreamEvent>, LlmError> {
        loop {
            let n = read_line_bytes(reader, &mut self.line_buf).await?;
            if n == 0 {
                return Ok(None);
            }
            let line = String::from_utf8_lossy(&self.line_buf);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Err(e) = serde_json::from_str::<serde_json::Value>(line) {
                return Err(LlmError::ParseError(format!(
                    "invalid NDJSON line ({e}): {}",
                    line.chars().take(120).collect::<String>()
                )));
            }
            return Ok(Some(StreamEvent {
                event_type: "message".to_string(),
                data: line.to_string(),
                id: None,
                retry: None,
                raw: Bytes::copy_from_slice(&self.line_buf),
            }));
        }
    }

    fn format(&self) -> StreamFormat {
        self.format.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_lines_and_skips_blanks() {
        let mut input: &[u8] = b"{\"a\":1}\n\n  \n{\"a\":2}";
        let mut dec = NdjsonDecoder::new();
        let first = dec.decode(&mut input).await.unwrap().unwrap();
        assert_eq!(first.data, "{\"a\":1}");
        let second = dec.decode(&mut input).await.unwrap().unwrap();
        assert_eq!(second.data, "{\"a\":2}");
        assert!(dec.decode(&mut input).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_line_is_consumed_and_reported() {
        let mut input: &[u8] = b"{oops\n{\"ok\":true}\n";
        let mut dec = NdjsonDecoder::new();
        let err = dec.decode(&mut input).await.unwrap_err();
        assert!(err.is_skippable_decode_error());
        let next = dec.decode(&mut input).await.unwrap().unwrap();
        assert_eq!(next.data, "{\"ok\":true}");
    }

    #[tokio::test]
    async fn crlf_lines_are_trimmed() {
        let mut input: &[u8] = b"{\"x\":1}\r\n";
        let mut dec = NdjsonDecoder::json_stream();
        assert_eq!(dec.format(), StreamFormat::JsonStream);
        let ev = dec.decode(&mut input).await.unwrap().unwrap();
        assert_eq!(ev.data, "{\"x\":1}");
    }
}
