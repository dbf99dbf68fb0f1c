//! Event-to-chunk translation contract.

use crate::error::LlmError;
use crate::streaming::StreamEvent;
use crate::types::ChatCompletionChunk;

/// Turns decoded events into uniform chunks for one stream.
///
/// A translator emits exactly one chunk with `done = true`, either from
/// `translate` when the provider signals the end, or from `finish` when the
/// transport ends after the provider reported a finish reason. Errors of kind
/// `ParseError` mark a single bad event; other errors end the stream.
pub trait StreamTranslator: Send {
    fn translate(&mut self, event: &StreamEvent) -> Result<Vec<ChatCompletionChunk>, LlmError>;

    /// Called once at end of transport if no terminal chunk was produced yet.
    fn finish(&mut self) -> Result<Vec<ChatCompletionChunk>, LlmError> {
        Ok(Vec::new())
    }

    /// Response id and model observed so far, used for a synthesized terminal chunk.
    fn identity(&self) -> (String, String);
}
