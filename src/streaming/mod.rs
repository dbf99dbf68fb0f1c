//! Streaming: decoders, format detection, tool-call assembly and `ChatStream`.

pub mod chat_stream;
pub mod decoder;
pub mod detect;
pub mod event;
pub mod factory;
pub mod ndjson;
pub mod sse;
pub mod tool_calls;
pub mod translator;

pub use chat_stream::{ChatResponse, ChatStream, StreamOutcome, StreamState, response_reader};
pub use decoder::{ByteReader, StreamDecoder};
pub use detect::{detect_format, format_from_content_type, format_from_prefix};
pub use event::{StreamEvent, StreamFormat};
pub use factory::{DecoderConstructor, DecoderFactory};
pub use ndjson::NdjsonDecoder;
pub use sse::SseDecoder;
pub use tool_calls::ToolCallAccumulator;
pub use translator::StreamTranslator;
