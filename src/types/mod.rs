//! Provider-agnostic request and response types.

pub mod chunk;
pub mod message;
pub mod models;
pub mod options;
pub mod tools;

pub use chunk::{ChatCompletionChunk, Usage, finish_reason, normalize_finish_reason};
pub use message::{ChatMessage, ContentPart, MessageRole, validate_messages};
pub use models::{HealthStatus, ModelCapability, ModelInfo, ProgressUpdate, RunningModel};
pub use options::{GenerateOptions, ResponseFormat};
pub use tools::{Tool, ToolCall, ToolCallDelta, ToolChoice, ToolFormat, validate_tools};
