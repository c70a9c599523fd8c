//! Provider adapters
//!
//! This module defines the [LlmAdapter] trait every vendor adapter implements,
//! plus the request/stream helpers shared by the OpenAI-compatible family.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{Value, json};

use crate::error::{ProviderError, Result};
use crate::model::ResolvedModel;
use crate::stream::{ChunkStream, StreamChunk, ToolCallAccumulator, UsageChunk};
use crate::think::{ThinkPiece, ThinkTagScanner};
use crate::types::{Message, RequestMetadata, Tool, ToolChoice, ToolProtocol};
use crate::usage::estimate_tokens;

pub mod anthropic;
pub mod bedrock;
pub mod cerebras;
pub mod copilot;
pub mod fallback;
pub mod openai;
pub mod openrouter;

pub use anthropic::AnthropicAdapter;
pub use bedrock::{BedrockAdapter, BedrockProfileResolver, ProfileLookup};
pub use cerebras::CerebrasAdapter;
pub use copilot::CopilotAdapter;
pub use fallback::{Clock, FallbackRouter, QuotaProfile, SystemClock};
pub use openai::OpenAiAdapter;
pub use openrouter::{KiloCodeAdapter, OpenRouterAdapter};

/// Uniform streaming contract for one vendor family.
///
/// `create_message` returns a single-pass chunk stream; dropping it cancels
/// the request. Adapter instances are not required to support overlapping
/// `create_message` calls on themselves.
#[async_trait]
pub trait LlmAdapter: Send + Sync {
  /// Configured model id, descriptor and resolved parameters.
  ///
  /// Never fails: an unknown configured id falls back to the provider's
  /// default model descriptor.
  fn get_model(&self) -> ResolvedModel;

  /// Streams a normalized response for a conversation turn.
  async fn create_message(
    &self,
    system_prompt: &str,
    messages: &[Message],
    metadata: RequestMetadata,
  ) -> Result<ChunkStream>;

  /// Non-streaming single-turn completion; empty content yields `""`.
  async fn complete_prompt(&self, prompt: &str) -> Result<String>;

  /// Token count for arbitrary content; heuristic unless overridden.
  async fn count_tokens(&self, content: &str) -> Result<u32> {
    Ok(estimate_tokens(content))
  }
}

/// Default HTTP client for adapters.
pub fn create_client(timeout_secs: Option<u64>) -> Client {
  let timeout = std::time::Duration::from_secs(timeout_secs.unwrap_or(120));

  Client::builder()
    .timeout(timeout)
    .build()
    .unwrap_or_else(|_| Client::new())
}

/// OpenAI-wire message list with the system prompt first.
pub(crate) fn openai_messages(system_prompt: &str, messages: &[Message]) -> Vec<Value> {
  let mut out = Vec::with_capacity(messages.len() + 1);
  if !system_prompt.is_empty() {
    out.push(json!({"role": "system", "content": system_prompt}));
  }
  for message in messages {
    out.push(openai_message(message));
  }
  out
}

fn openai_message(message: &Message) -> Value {
  match message {
    Message::System { content } => json!({"role": "system", "content": content}),
    Message::User { content } => json!({"role": "user", "content": content}),
    Message::Assistant {
      content,
      tool_calls,
    } => {
      let mut value = json!({"role": "assistant", "content": content});
      if !tool_calls.is_empty() {
        value["tool_calls"] = json!(tool_calls);
      }
      value
    }
    Message::Tool {
      tool_call_id,
      content,
    } => json!({"role": "tool", "tool_call_id": tool_call_id, "content": content}),
  }
}

/// Tool definitions for an OpenAI-wire request; `None` under the text
/// protocol, which keeps tools off the wire entirely.
///
/// `strict` is forced to `false` on every function uniformly; mixed strict
/// flags are rejected by several gateways.
pub(crate) fn openai_tools(metadata: &RequestMetadata) -> Option<Value> {
  let tools = metadata.native_tools()?;
  let tools: Vec<Value> = tools.iter().map(openai_tool).collect();
  Some(Value::Array(tools))
}

fn openai_tool(tool: &Tool) -> Value {
  json!({
    "type": tool.tool_type,
    "function": {
      "name": tool.function.name,
      "description": tool.function.description,
      "parameters": tool.function.parameters,
      "strict": false,
    },
  })
}

pub(crate) fn openai_tool_choice(choice: &ToolChoice) -> Value {
  match choice {
    ToolChoice::Auto => json!("auto"),
    ToolChoice::None => json!("none"),
    ToolChoice::Required => json!("required"),
    ToolChoice::Function { name } => {
      json!({"type": "function", "function": {"name": name}})
    }
  }
}

/// Error object embedded in a 200 body or stream event.
///
/// OpenRouter and several gateways report failures this way instead of an
/// HTTP status.
pub(crate) fn embedded_error(provider: &'static str, value: &Value) -> Option<ProviderError> {
  let error = value.get("error")?;
  if error.is_null() {
    return None;
  }
  let message = error
    .get("message")
    .and_then(Value::as_str)
    .unwrap_or("unknown vendor error")
    .to_string();
  let code = error
    .get("code")
    .map(|c| match c {
      Value::String(s) => s.clone(),
      other => other.to_string(),
    });
  Some(ProviderError::VendorProtocol {
    provider: provider.to_string(),
    message,
    code,
  })
}

/// Usage snapshot from an OpenAI-wire `usage` object.
pub(crate) fn parse_usage_snapshot(value: &Value) -> Option<UsageChunk> {
  let usage = value.get("usage")?;
  let input_tokens = usage
    .get("prompt_tokens")
    .or_else(|| usage.get("input_tokens"))
    .and_then(Value::as_u64)
    .unwrap_or(0) as u32;
  let output_tokens = usage
    .get("completion_tokens")
    .or_else(|| usage.get("output_tokens"))
    .and_then(Value::as_u64)
    .unwrap_or(0) as u32;
  if input_tokens == 0 && output_tokens == 0 {
    return None;
  }
  let cache_read_tokens = usage
    .get("prompt_tokens_details")
    .and_then(|d| d.get("cached_tokens"))
    .or_else(|| usage.get("cache_read_input_tokens"))
    .and_then(Value::as_u64)
    .map(|t| t as u32);
  let reasoning_tokens = usage
    .get("completion_tokens_details")
    .and_then(|d| d.get("reasoning_tokens"))
    .and_then(Value::as_u64)
    .map(|t| t as u32);

  Some(UsageChunk {
    input_tokens,
    output_tokens,
    cache_read_tokens,
    cache_write_tokens: None,
    reasoning_tokens,
    total_cost: None,
    inference_provider: None,
  })
}

/// Content chunks from one chat-completions stream event.
///
/// Covers `delta.content`, `delta.reasoning_content`/`delta.reasoning` and
/// incremental `delta.tool_calls`. Usage is handled separately via
/// [parse_usage_snapshot].
pub(crate) fn chat_delta_chunks(value: &Value) -> Vec<StreamChunk> {
  let mut chunks = Vec::new();
  let Some(choice) = value
    .get("choices")
    .and_then(Value::as_array)
    .and_then(|choices| choices.first())
  else {
    return chunks;
  };
  let Some(delta) = choice.get("delta") else {
    return chunks;
  };

  if let Some(text) = delta
    .get("reasoning_content")
    .or_else(|| delta.get("reasoning"))
    .and_then(Value::as_str)
    .filter(|t| !t.is_empty())
  {
    chunks.push(StreamChunk::Reasoning {
      text: text.to_string(),
    });
  }

  if let Some(text) = delta.get("content").and_then(Value::as_str).filter(|t| !t.is_empty()) {
    chunks.push(StreamChunk::Text {
      text: text.to_string(),
    });
  }

  if let Some(tool_calls) = delta.get("tool_calls").and_then(Value::as_array) {
    for call in tool_calls {
      let index = call.get("index").and_then(Value::as_u64).unwrap_or(0) as u32;
      let id = call.get("id").and_then(Value::as_str).map(ToString::to_string);
      let name = call
        .get("function")
        .and_then(|f| f.get("name"))
        .and_then(Value::as_str)
        .map(ToString::to_string);
      let arguments = call
        .get("function")
        .and_then(|f| f.get("arguments"))
        .and_then(Value::as_str)
        .map(ToString::to_string);
      if id.is_none() && name.is_none() && arguments.is_none() {
        continue;
      }
      chunks.push(StreamChunk::ToolCallPartial {
        index,
        id,
        name,
        arguments,
      });
    }
  }

  chunks
}

/// Applies the requested tool protocol to an adapter's chunk sequence.
///
/// Under the native protocol, `tool_call_partial` chunks pass through and are
/// accumulated; the completed calls are emitted as one `native_tool_calls`
/// chunk ahead of the usage snapshot (or at end of stream when no usage
/// arrives). Under the text protocol every tool chunk is dropped.
pub(crate) fn apply_tool_protocol(protocol: ToolProtocol, inner: ChunkStream) -> ChunkStream {
  Box::pin(async_stream::try_stream! {
    let mut inner = inner;
    let mut calls = ToolCallAccumulator::new();

    while let Some(chunk) = inner.next().await {
      let chunk = chunk?;
      match &chunk {
        StreamChunk::ToolCallPartial { .. }
        | StreamChunk::ToolCall { .. }
        | StreamChunk::NativeToolCalls { .. }
          if protocol != ToolProtocol::Native =>
        {
          continue;
        }
        StreamChunk::Usage(_) => {
          if !calls.is_empty() {
            let tool_calls = std::mem::take(&mut calls).finish();
            yield StreamChunk::NativeToolCalls { tool_calls };
          }
        }
        _ => calls.push(&chunk),
      }
      yield chunk;
    }

    if !calls.is_empty() {
      yield StreamChunk::NativeToolCalls { tool_calls: calls.finish() };
    }
  })
}

/// Routes text chunks through a think-tag scanner; other chunks pass through.
pub(crate) fn scan_think_tags(
  scanner: &mut ThinkTagScanner,
  chunks: Vec<StreamChunk>,
) -> Vec<StreamChunk> {
  let mut out = Vec::with_capacity(chunks.len());
  for chunk in chunks {
    match chunk {
      StreamChunk::Text { text } => {
        for piece in scanner.push(&text) {
          out.push(match piece {
            ThinkPiece::Text(text) => StreamChunk::Text { text },
            ThinkPiece::Reasoning(text) => StreamChunk::Reasoning { text },
          });
        }
      }
      other => out.push(other),
    }
  }
  out
}

/// Flushes scanner state at end of stream.
pub(crate) fn flush_think_tags(scanner: &mut ThinkTagScanner) -> Vec<StreamChunk> {
  scanner
    .finish()
    .into_iter()
    .map(|piece| match piece {
      ThinkPiece::Text(text) => StreamChunk::Text { text },
      ThinkPiece::Reasoning(text) => StreamChunk::Reasoning { text },
    })
    .collect()
}

/// Message content from a non-streaming chat-completions response; `""` when
/// absent.
pub(crate) fn extract_completion_text(value: &Value) -> String {
  value
    .get("choices")
    .and_then(Value::as_array)
    .and_then(|choices| choices.first())
    .and_then(|choice| choice.get("message"))
    .and_then(|message| message.get("content"))
    .and_then(Value::as_str)
    .unwrap_or_default()
    .to_string()
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_chat_delta_text_and_reasoning() {
    let event = json!({"choices": [{"delta": {"content": "hi", "reasoning_content": "hmm"}}]});
    let chunks = chat_delta_chunks(&event);
    assert_eq!(
      chunks,
      vec![
        StreamChunk::Reasoning { text: "hmm".to_string() },
        StreamChunk::Text { text: "hi".to_string() },
      ]
    );
  }

  #[test]
  fn test_chat_delta_tool_call_partial() {
    let event = json!({"choices": [{"delta": {"tool_calls": [
      {"index": 0, "id": "call_1", "function": {"name": "f", "arguments": "{\"a\""}}
    ]}}]});
    let chunks = chat_delta_chunks(&event);
    assert_eq!(chunks.len(), 1);
    assert!(matches!(
      &chunks[0],
      StreamChunk::ToolCallPartial { index: 0, id: Some(_), name: Some(_), arguments: Some(_) }
    ));
  }

  #[test]
  fn test_usage_snapshot_requires_nonzero_counts() {
    assert!(parse_usage_snapshot(&json!({"usage": {"prompt_tokens": 0, "completion_tokens": 0}})).is_none());
    let usage = parse_usage_snapshot(&json!({"usage": {"prompt_tokens": 10, "completion_tokens": 5}}))
      .expect("usage");
    assert_eq!(usage.input_tokens, 10);
    assert_eq!(usage.output_tokens, 5);
  }

  #[test]
  fn test_embedded_error_detection() {
    let body = json!({"error": {"message": "rate limited", "code": 429}});
    let err = embedded_error("openrouter", &body).expect("error");
    match err {
      ProviderError::VendorProtocol { message, code, .. } => {
        assert_eq!(message, "rate limited");
        assert_eq!(code.as_deref(), Some("429"));
      }
      other => panic!("unexpected error: {other:?}"),
    }
    assert!(embedded_error("openrouter", &json!({"choices": []})).is_none());
  }

  fn tool_metadata(protocol: ToolProtocol) -> RequestMetadata {
    RequestMetadata {
      tools: Some(vec![Tool {
        tool_type: "function".to_string(),
        function: crate::types::FunctionDefinition {
          name: "read_file".to_string(),
          description: Some("Reads a file".to_string()),
          parameters: json!({"type": "object"}),
        },
      }]),
      tool_protocol: protocol,
      ..Default::default()
    }
  }

  #[test]
  fn test_tools_force_strict_false() {
    let tools = openai_tools(&tool_metadata(ToolProtocol::Native)).expect("tools");
    assert_eq!(tools[0]["function"]["strict"], json!(false));
  }

  #[test]
  fn test_text_protocol_keeps_tools_off_the_wire() {
    assert!(openai_tools(&tool_metadata(ToolProtocol::Text)).is_none());
  }

  fn chunk_source(chunks: Vec<StreamChunk>) -> ChunkStream {
    Box::pin(futures::stream::iter(chunks.into_iter().map(Ok)))
  }

  #[tokio::test]
  async fn test_native_protocol_emits_accumulated_tool_calls() {
    let usage = UsageChunk {
      input_tokens: 3,
      output_tokens: 7,
      ..Default::default()
    };
    let inner = chunk_source(vec![
      StreamChunk::ToolCallPartial {
        index: 0,
        id: Some("call_1".to_string()),
        name: Some("read_file".to_string()),
        arguments: Some(r#"{"path":"#.to_string()),
      },
      StreamChunk::ToolCallPartial {
        index: 0,
        id: None,
        name: None,
        arguments: Some(r#""a.txt"}"#.to_string()),
      },
      StreamChunk::Usage(usage.clone()),
    ]);

    let chunks: Vec<StreamChunk> = apply_tool_protocol(ToolProtocol::Native, inner)
      .map(|chunk| chunk.expect("chunk"))
      .collect()
      .await;

    assert_eq!(chunks.len(), 4);
    assert_eq!(
      chunks[2],
      StreamChunk::NativeToolCalls {
        tool_calls: vec![crate::types::ToolCall::new(
          "call_1",
          "read_file",
          r#"{"path":"a.txt"}"#,
        )],
      }
    );
    assert_eq!(chunks[3], StreamChunk::Usage(usage));
  }

  #[tokio::test]
  async fn test_text_protocol_drops_tool_chunks() {
    let inner = chunk_source(vec![
      StreamChunk::Text { text: "hi".to_string() },
      StreamChunk::ToolCallPartial {
        index: 0,
        id: Some("call_1".to_string()),
        name: Some("read_file".to_string()),
        arguments: Some("{}".to_string()),
      },
      StreamChunk::Usage(UsageChunk {
        input_tokens: 1,
        output_tokens: 1,
        ..Default::default()
      }),
    ]);

    let chunks: Vec<StreamChunk> = apply_tool_protocol(ToolProtocol::Text, inner)
      .map(|chunk| chunk.expect("chunk"))
      .collect()
      .await;

    assert_eq!(chunks.len(), 2);
    assert!(matches!(chunks[0], StreamChunk::Text { .. }));
    assert!(matches!(chunks[1], StreamChunk::Usage(_)));
  }
}
