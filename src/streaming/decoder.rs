//! Decoder trait
//!
//! Decoders are stateful; each stream gets its own instance from the factory.

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use super::event::{StreamEvent, StreamFormat};
use crate::error::LlmError;

/// Boxed byte source a decoder reads from.
pub type ByteReader = dyn AsyncBufRead + Send + Unpin;

#[async_trait]
pub trait StreamDecoder: Send {
    /// Next event, `Ok(None)` at end of stream.
    async fn decode(&mut self, reader: &mut ByteReader) -> Result<Option<StreamEvent>, LlmError>;

    fn format(&self) -> StreamFormat;
}

/// Read one `\n`-terminated line into `buf` (terminator included).
/// Returns the number of bytes read; zero means end of stream.
pub(crate) async fn read_line_bytes(
    reader: &mut ByteReader,
    buf: &mut Vec<u8>,
) -> Result<usize, LlmError> {
    buf.clear();
    reader
        .read_until(b'\n', buf)
        .await
        .map_err(|e| LlmError::HttpError(format!("stream read failed: {e}")))
}
