//! Assembly of streamed tool-call fragments.
//!
//! OpenAI-style streams send tool calls as deltas keyed by slot index. A delta
//! that carries an id opens a new entry for its slot; later deltas for the same
//! slot append to the arguments. A name, once seen, is kept.

use std::collections::BTreeMap;

use crate::error::LlmError;
use crate::types::{ToolCall, ToolCallDelta};

#[derive(Debug, Default, Clone)]
struct Slot {
    id: String,
    name: String,
    arguments: String,
}

#[derive(Debug, Default, Clone)]
pub struct ToolCallAccumulator {
    slots: BTreeMap<usize, Slot>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, delta: &ToolCallDelta) {
        let new_id = delta.id.as_deref().filter(|id| !id.is_empty());
        let slot = self.slots.entry(delta.index).or_default();
        if let Some(id) = new_id
            && slot.id != id
        {
            if !slot.id.is_empty() {
                tracing::debug!(target: "infergate::stream", index = delta.index, old = %slot.id, new = %id, "tool call slot reopened");
            }
            *slot = Slot {
                id: id.to_string(),
                ..Default::default()
            };
        }
        if let Some(name) = delta.name.as_deref().filter(|n| !n.is_empty()) {
            slot.name = name.to_string();
        }
        slot.arguments.push_str(&delta.arguments);
    }

    /// Record a call that arrived complete (Ollama, Gemini).
    pub fn push_complete(&mut self, call: ToolCall) {
        let index = self.slots.keys().next_back().map_or(0, |k| k + 1);
        self.slots.insert(
            index,
            Slot {
                id: call.id,
                name: call.name,
                arguments: call.arguments,
            },
        );
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Final tool calls. Empty argument strings become `{}`; anything that is
    /// still not valid JSON is an error rather than a partial string.
    pub fn finish(&self) -> Result<Vec<ToolCall>, LlmError> {
        self.slots
            .iter()
            .map(|(index, slot)| {
                let args = slot.arguments.trim();
                let arguments = if args.is_empty() {
                    "{}".to_string()
                } else {
                    serde_json::from_str::<serde_json::Value>(args).map_err(|e| {
                        LlmError::StreamError(format!(
                            "tool call {index} ('{}') arguments are not valid JSON: {e}",
                            slot.name
                        ))
                    })?;
                    slot.arguments.clone()
                };
                let id = if slot.id.is_empty() {
                    format!("call_{index}")
                } else {
                    slot.id.clone()
                };
                Ok(ToolCall {
                    id,
                    name: slot.name.clone(),
                    arguments,
                })
            })
            .collect()
    }
}
