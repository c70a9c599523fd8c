//! Canonical stream protocol
//!
//! Every adapter's `create_message` yields a single-pass, forward-only
//! sequence of [StreamChunk]. The sequence is not restartable; dropping it is
//! the cancellation signal.

use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::pin::Pin;

use crate::error::Result;
use crate::types::ToolCall;

/// One normalized event in an adapter's output sequence.
///
/// Consumers must tolerate any interleaving of `Text`/`Reasoning`, repeated
/// `ToolCallPartial` indexes (continuations, `id`/`name` only on the first
/// occurrence per index) and at most one terminal `Usage` snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
  /// Final-answer text delta
  Text { text: String },

  /// Chain-of-thought delta, distinct from answer text
  Reasoning { text: String },

  /// Token/cost snapshot
  Usage(UsageChunk),

  /// Incremental tool call; concatenate `arguments` per `index`
  ToolCallPartial {
    index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<String>,
  },

  /// Complete tool call (non-streaming path)
  ToolCall {
    id: String,
    name: String,
    arguments: String,
  },

  /// All accumulated native tool calls for the request
  NativeToolCalls { tool_calls: Vec<ToolCall> },

  /// Anthropic thinking block with its signature; replayed verbatim next turn
  #[serde(rename = "ant_thinking")]
  Thinking { thinking: String, signature: String },

  /// Opaque redacted-thinking payload; replayed verbatim next turn
  #[serde(rename = "ant_redacted_thinking")]
  RedactedThinking { data: String },
}

/// Token counts and computed cost carried by a `usage` chunk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct UsageChunk {
  pub input_tokens: u32,
  pub output_tokens: u32,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub cache_read_tokens: Option<u32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub cache_write_tokens: Option<u32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub reasoning_tokens: Option<u32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub total_cost: Option<f64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub inference_provider: Option<String>,
}

impl UsageChunk {
  pub fn is_empty(&self) -> bool {
    self.input_tokens == 0
      && self.output_tokens == 0
      && self.cache_read_tokens.unwrap_or(0) == 0
      && self.cache_write_tokens.unwrap_or(0) == 0
  }
}

/// Adapter output: a pinned, single-consumer chunk stream.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// Reassembles complete tool calls from `ToolCallPartial` chunks.
///
/// Partials sharing an index are concatenated in arrival order; the first
/// occurrence per index supplies `id` and `name`. Other chunk kinds are
/// ignored.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
  calls: BTreeMap<u32, PartialCall>,
}

#[derive(Debug, Default)]
struct PartialCall {
  id: String,
  name: String,
  arguments: String,
}

impl ToolCallAccumulator {
  pub fn new() -> Self {
    Self::default()
  }

  /// Feed one chunk; non-tool chunks are a no-op.
  pub fn push(&mut self, chunk: &StreamChunk) {
    if let StreamChunk::ToolCallPartial {
      index,
      id,
      name,
      arguments,
    } = chunk
    {
      let entry = self.calls.entry(*index).or_default();
      if let Some(id) = id {
        if entry.id.is_empty() {
          entry.id = id.clone();
        }
      }
      if let Some(name) = name {
        if entry.name.is_empty() {
          entry.name = name.clone();
        }
      }
      if let Some(arguments) = arguments {
        entry.arguments.push_str(arguments);
      }
    }
  }

  pub fn is_empty(&self) -> bool {
    self.calls.is_empty()
  }

  /// Complete calls in index order.
  pub fn finish(self) -> Vec<ToolCall> {
    self
      .calls
      .into_values()
      .map(|call| ToolCall::new(call.id, call.name, call.arguments))
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_chunk_wire_tags() {
    let chunk = StreamChunk::Text {
      text: "hi".to_string(),
    };
    let json = serde_json::to_value(&chunk).expect("serialize");
    assert_eq!(json["type"], "text");

    let chunk = StreamChunk::Thinking {
      thinking: "t".to_string(),
      signature: "s".to_string(),
    };
    let json = serde_json::to_value(&chunk).expect("serialize");
    assert_eq!(json["type"], "ant_thinking");

    let chunk = StreamChunk::Usage(UsageChunk {
      input_tokens: 10,
      output_tokens: 5,
      ..Default::default()
    });
    let json = serde_json::to_value(&chunk).expect("serialize");
    assert_eq!(json["type"], "usage");
    assert_eq!(json["input_tokens"], 10);
    assert!(json.get("total_cost").is_none());
  }

  #[test]
  fn test_tool_call_accumulator_concatenates_by_index() {
    let mut acc = ToolCallAccumulator::new();
    acc.push(&StreamChunk::ToolCallPartial {
      index: 0,
      id: Some("call_1".to_string()),
      name: Some("read_file".to_string()),
      arguments: Some(r#"{"path":"#.to_string()),
    });
    acc.push(&StreamChunk::ToolCallPartial {
      index: 1,
      id: Some("call_2".to_string()),
      name: Some("list_dir".to_string()),
      arguments: Some("{}".to_string()),
    });
    acc.push(&StreamChunk::ToolCallPartial {
      index: 0,
      id: None,
      name: None,
      arguments: Some(r#""a.txt"}"#.to_string()),
    });

    let calls = acc.finish();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].id, "call_1");
    assert_eq!(calls[0].function.arguments, r#"{"path":"a.txt"}"#);
    assert_eq!(calls[1].function.name, "list_dir");
  }
}
