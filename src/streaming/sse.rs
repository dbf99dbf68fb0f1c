//! Server-Sent Events decoder (WHATWG event-stream interpretation).
//!
//! - `field:value` and `field: value` (one leading space stripped)
//! - lines starting with `:` are comments; lines without a colon are dropped
//! - `event` sets the type of the next dispatch only
//! - `data` lines are joined with `\n`
//! - `id` and `retry` persist across dispatches; an `id` containing NUL and a
//!   non-numeric `retry` are ignored
//! - a blank line dispatches; nothing is dispatched while the data buffer is empty
//! - `\n`, `\r\n` and lone `\r` all terminate lines
//! - a partially buffered event is dispatched at end of stream

use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use super::decoder::{ByteReader, StreamDecoder, read_line_bytes};
use super::event::{StreamEvent, StreamFormat};
use crate::error::LlmError;

#[derive(Debug, Default)]
pub struct SseDecoder {
    event_type: Option<String>,
    data: Vec<String>,
    last_id: Option<String>,
    retry: Option<u64>,
    raw: BytesMut,
    pending_lines: VecDeque<String>,
    line_buf: Vec<u8>,
    started: bool,
    eof: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next logical line without its terminator; `None` at end of stream.
    async fn next_line(&mut self, reader: &mut ByteReader) -> Result<Option<String>, LlmError> {
        loop {
            if let Some(line) = self.pending_lines.pop_front() {
                return Ok(Some(line));
            }
            if self.eof {
                return Ok(None);
            }
            let n = read_line_bytes(reader, &mut self.line_buf).await?;
            if n == 0 {
                self.eof = true;
                return Ok(None);
            }
            self.raw.extend_from_slice(&self.line_buf);

            let mut bytes: &[u8] = &self.line_buf;
            if !self.started {
                self.started = true;
                bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
            }
            let had_lf = bytes.last() == Some(&b'\n');
            if had_lf {
                bytes = &bytes[..bytes.len() - 1];
            }
            let text = String::from_utf8_lossy(bytes);
            let text = text.strip_suffix('\r').unwrap_or(&text);

            // Lone CRs inside the chunk are line terminators too.
            let mut parts: Vec<&str> = text.split('\r').collect();
            if !had_lf && parts.last().is_some_and(|p| p.is_empty()) && parts.len() > 1 {
                parts.pop();
            }
            self.pending_lines
                .extend(parts.into_iter().map(str::to_string));
        }
    }

    fn process_field(&mut self, line: &str) {
        let Some(colon) = line.find(':') else {
            return;
        };
        let field = &line[..colon];
        let mut value = &line[colon + 1..];
        if let Some(stripped) = value.strip_prefix(' ') {
            value = stripped;
        }
        match field {
            "event" => self.event_type = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => {
                if !value.contains('\0') && !value.is_empty() {
                    self.last_id = Some(value.to_string());
                }
            }
            "retry" => {
                if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit())
                    && let Ok(ms) = value.parse::<u64>()
                {
                    self.retry = Some(ms);
                }
            }
            _ => {}
        }
    }

    fn dispatch(&mut self) -> Option<StreamEvent> {
        let event_type = self.event_type.take();
        let raw = self.raw.split().freeze();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(StreamEvent {
            event_type: event_type
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| "message".to_string()),
            data,
            id: self.last_id.clone(),
            retry: self.retry,
            raw: if raw.is_empty() { Bytes::new() } else { raw },
        })
    }
}

#[async_trait]
impl StreamDecoder for SseDecoder {
    async fn decode(&mut self, reader: &mut ByteReader) -> Result<Option<StreamEvent>, LlmError> {
        loop {
            let Some(line) = self.next_line(reader).await? else {
                return Ok(self.dispatch());
            };
            if line.is_empty() {
                if let Some(event) = self.dispatch() {
                    return Ok(Some(event));
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            self.process_field(&line);
        }
    }

    fn format(&self) -> StreamFormat {
        StreamFormat::Sse
    }
}
