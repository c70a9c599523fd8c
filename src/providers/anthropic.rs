//! Anthropic Messages streaming adapter.
//!
//! Consumes the Messages-API SSE event family (`message_start`,
//! `content_block_start/delta/stop`, `message_delta`, `message_stop`).
//! Thinking deltas surface immediately as reasoning chunks and are also
//! accumulated into one `ant_thinking` chunk once the block's signature is
//! known, since both must be replayed verbatim on the next turn. Usage is the
//! one place token counts accumulate across events: `message_start` carries
//! the input-side counts, `message_delta` the growing output count.

use async_trait::async_trait;
use futures::{StreamExt, pin_mut};
use reqwest::Client;
use serde_json::{Value, json};
use std::collections::HashMap;

use super::{LlmAdapter, apply_tool_protocol, create_client};
use crate::error::{ProviderError, Result};
use crate::model::{ANTHROPIC_DEFAULT_MODEL, ModelDescriptor, ResolvedModel, anthropic_models, lookup_model};
use crate::params::{ParamsFormat, ReasoningConfig, resolve_params};
use crate::sse::sse_event_stream;
use crate::stream::{ChunkStream, StreamChunk, UsageChunk};
use crate::types::{Message, ProviderSettings, RequestMetadata};
use crate::usage::with_cost;

const PROVIDER: &str = "anthropic";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicAdapter {
  settings: ProviderSettings,
  models: HashMap<String, ModelDescriptor>,
  client: Client,
}

impl AnthropicAdapter {
  pub fn new(settings: ProviderSettings) -> Self {
    let client = create_client(settings.timeout);
    Self {
      settings,
      models: anthropic_models(),
      client,
    }
  }

  fn messages_url(&self) -> String {
    let base = self
      .settings
      .base_url
      .clone()
      .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
    format!("{}/v1/messages", base.trim_end_matches('/'))
  }

  fn request(&self, body: &Value) -> reqwest::RequestBuilder {
    self
      .client
      .post(self.messages_url())
      .header("x-api-key", self.settings.api_key.clone().unwrap_or_default())
      .header("anthropic-version", API_VERSION)
      .json(body)
  }

  fn build_body(
    &self,
    model: &ResolvedModel,
    system_prompt: &str,
    messages: &[Message],
    metadata: &RequestMetadata,
    stream: bool,
  ) -> Value {
    let mut body = json!({
      "model": model.id,
      "messages": anthropic_messages(messages),
      "stream": stream,
      "max_tokens": model.params.max_tokens.unwrap_or(model.info.max_tokens),
    });

    if !system_prompt.is_empty() {
      if model.info.supports_prompt_cache {
        body["system"] = json!([{
          "type": "text",
          "text": system_prompt,
          "cache_control": {"type": "ephemeral"},
        }]);
      } else {
        body["system"] = json!(system_prompt);
      }
    }

    if let Some(ReasoningConfig::Budget { budget_tokens }) = &model.params.reasoning {
      // Thinking forbids a temperature override
      body["thinking"] = json!({"type": "enabled", "budget_tokens": budget_tokens});
    } else if let Some(temperature) = model.params.temperature {
      body["temperature"] = json!(temperature);
    }

    if let Some(tools) = metadata.native_tools() {
      let tools: Vec<Value> = tools
        .iter()
        .map(|tool| {
          json!({
            "name": tool.function.name,
            "description": tool.function.description,
            "input_schema": tool.function.parameters,
          })
        })
        .collect();
      body["tools"] = Value::Array(tools);
    }

    body
  }
}

#[async_trait]
impl LlmAdapter for AnthropicAdapter {
  fn get_model(&self) -> ResolvedModel {
    let (id, info) = lookup_model(
      &self.models,
      self.settings.model_id.as_deref(),
      ANTHROPIC_DEFAULT_MODEL,
    );
    let params = resolve_params(ParamsFormat::Anthropic, &info, &self.settings, None);
    ResolvedModel { id, info, params }
  }

  async fn create_message(
    &self,
    system_prompt: &str,
    messages: &[Message],
    metadata: RequestMetadata,
  ) -> Result<ChunkStream> {
    let model = self.get_model();
    let body = self.build_body(&model, system_prompt, messages, &metadata, true);
    let response = self.request(&body).send().await?;

    let events = sse_event_stream(PROVIDER, response);
    let stream: ChunkStream = Box::pin(async_stream::try_stream! {
      pin_mut!(events);
      let mut state = MessageState::default();

      while let Some(event) = events.next().await {
        let event = event?;
        if event.data.is_empty() {
          continue;
        }
        let value: Value = match serde_json::from_str(&event.data) {
          Ok(value) => value,
          Err(_) => continue,
        };
        for chunk in state.on_event(&value)? {
          yield chunk;
        }
        if state.stopped {
          break;
        }
      }

      if !state.usage.is_empty() {
        yield StreamChunk::Usage(with_cost(&model.info, state.usage));
      }
    });
    Ok(apply_tool_protocol(metadata.tool_protocol, stream))
  }

  async fn complete_prompt(&self, prompt: &str) -> Result<String> {
    let model = self.get_model();
    let messages = vec![Message::user(prompt)];
    let body = self.build_body(&model, "", &messages, &RequestMetadata::default(), false);

    let response = self.request(&body).send().await?;
    let status = response.status();
    let text = response.text().await?;
    if !status.is_success() {
      return Err(ProviderError::from_http(PROVIDER, status.as_u16(), &text));
    }
    let value: Value = serde_json::from_str(&text)?;
    let content = value
      .get("content")
      .and_then(Value::as_array)
      .map(|blocks| {
        blocks
          .iter()
          .filter_map(|block| block.get("text").and_then(Value::as_str))
          .collect::<Vec<_>>()
          .join("")
      })
      .unwrap_or_default();
    Ok(content)
  }
}

/// Per-request stream state.
#[derive(Debug, Default)]
struct MessageState {
  usage: UsageChunk,
  stopped: bool,
  /// Thinking text accumulated for the current thinking block
  thinking: String,
  /// SSE content-block index -> tool-call ordinal
  tool_indexes: HashMap<u64, u32>,
  emitted_text_block: bool,
}

impl MessageState {
  fn on_event(&mut self, value: &Value) -> Result<Vec<StreamChunk>> {
    let event_type = value.get("type").and_then(Value::as_str).unwrap_or_default();
    let mut chunks = Vec::new();

    match event_type {
      "message_start" => {
        if let Some(usage) = value.get("message").and_then(|m| m.get("usage")) {
          self.usage.input_tokens += read_u32(usage, "input_tokens");
          self.usage.output_tokens += read_u32(usage, "output_tokens");
          add_opt(&mut self.usage.cache_read_tokens, read_u32(usage, "cache_read_input_tokens"));
          add_opt(
            &mut self.usage.cache_write_tokens,
            read_u32(usage, "cache_creation_input_tokens"),
          );
        }
      }
      "content_block_start" => {
        let index = value.get("index").and_then(Value::as_u64).unwrap_or(0);
        let block = value.get("content_block").cloned().unwrap_or(Value::Null);
        match block.get("type").and_then(Value::as_str).unwrap_or_default() {
          "text" => {
            // Later blocks render as new paragraphs
            if index > 0 && self.emitted_text_block {
              chunks.push(StreamChunk::Text {
                text: "\n".to_string(),
              });
            }
            self.emitted_text_block = true;
            if let Some(text) = block.get("text").and_then(Value::as_str).filter(|t| !t.is_empty()) {
              chunks.push(StreamChunk::Text {
                text: text.to_string(),
              });
            }
          }
          "thinking" => {
            self.thinking.clear();
            if let Some(text) = block.get("thinking").and_then(Value::as_str) {
              self.thinking.push_str(text);
            }
          }
          "redacted_thinking" => {
            if let Some(data) = block.get("data").and_then(Value::as_str) {
              chunks.push(StreamChunk::RedactedThinking {
                data: data.to_string(),
              });
            }
          }
          "tool_use" => {
            let ordinal = self.tool_indexes.len() as u32;
            self.tool_indexes.insert(index, ordinal);
            chunks.push(StreamChunk::ToolCallPartial {
              index: ordinal,
              id: block.get("id").and_then(Value::as_str).map(ToString::to_string),
              name: block.get("name").and_then(Value::as_str).map(ToString::to_string),
              arguments: None,
            });
          }
          _ => {}
        }
      }
      "content_block_delta" => {
        let index = value.get("index").and_then(Value::as_u64).unwrap_or(0);
        let delta = value.get("delta").cloned().unwrap_or(Value::Null);
        match delta.get("type").and_then(Value::as_str).unwrap_or_default() {
          "text_delta" => {
            if let Some(text) = delta.get("text").and_then(Value::as_str) {
              chunks.push(StreamChunk::Text {
                text: text.to_string(),
              });
            }
          }
          "thinking_delta" => {
            if let Some(text) = delta.get("thinking").and_then(Value::as_str) {
              self.thinking.push_str(text);
              chunks.push(StreamChunk::Reasoning {
                text: text.to_string(),
              });
            }
          }
          "signature_delta" => {
            if let Some(signature) = delta.get("signature").and_then(Value::as_str) {
              chunks.push(StreamChunk::Thinking {
                thinking: std::mem::take(&mut self.thinking),
                signature: signature.to_string(),
              });
            }
          }
          "input_json_delta" => {
            if let Some(partial) = delta.get("partial_json").and_then(Value::as_str) {
              let ordinal = self.tool_indexes.get(&index).copied().unwrap_or(0);
              chunks.push(StreamChunk::ToolCallPartial {
                index: ordinal,
                id: None,
                name: None,
                arguments: Some(partial.to_string()),
              });
            }
          }
          _ => {}
        }
      }
      "message_delta" => {
        if let Some(usage) = value.get("usage") {
          self.usage.output_tokens = read_u32(usage, "output_tokens");
        }
      }
      "message_stop" => {
        self.stopped = true;
      }
      "error" => {
        let message = value
          .get("error")
          .and_then(|e| e.get("message"))
          .and_then(Value::as_str)
          .unwrap_or("stream error")
          .to_string();
        return Err(ProviderError::VendorProtocol {
          provider: PROVIDER.to_string(),
          message,
          code: None,
        });
      }
      _ => {}
    }

    Ok(chunks)
  }
}

fn read_u32(usage: &Value, field: &str) -> u32 {
  usage.get(field).and_then(Value::as_u64).unwrap_or(0) as u32
}

fn add_opt(slot: &mut Option<u32>, value: u32) {
  if value > 0 {
    *slot = Some(slot.unwrap_or(0) + value);
  }
}

/// Messages in Anthropic wire shape: tool results become `tool_result` user
/// content, assistant tool calls become `tool_use` blocks.
fn anthropic_messages(messages: &[Message]) -> Vec<Value> {
  let mut out = Vec::with_capacity(messages.len());
  for message in messages {
    match message {
      Message::System { content } => {
        // System turns mid-conversation fold into user turns
        out.push(json!({"role": "user", "content": content}));
      }
      Message::User { content } => {
        out.push(json!({"role": "user", "content": content}));
      }
      Message::Assistant {
        content,
        tool_calls,
      } => {
        if tool_calls.is_empty() {
          out.push(json!({"role": "assistant", "content": content}));
        } else {
          let mut blocks = Vec::new();
          if !content.is_empty() {
            blocks.push(json!({"type": "text", "text": content}));
          }
          for call in tool_calls {
            let input: Value =
              serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| json!({}));
            blocks.push(json!({
              "type": "tool_use",
              "id": call.id,
              "name": call.function.name,
              "input": input,
            }));
          }
          out.push(json!({"role": "assistant", "content": blocks}));
        }
      }
      Message::Tool {
        tool_call_id,
        content,
      } => {
        out.push(json!({
          "role": "user",
          "content": [{
            "type": "tool_result",
            "tool_use_id": tool_call_id,
            "content": content,
          }],
        }));
      }
    }
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_thinking_accumulates_until_signature() {
    let mut state = MessageState::default();
    let start = json!({"type": "content_block_start", "index": 0,
      "content_block": {"type": "thinking", "thinking": ""}});
    assert!(state.on_event(&start).expect("event").is_empty());

    let d1 = json!({"type": "content_block_delta", "index": 0,
      "delta": {"type": "thinking_delta", "thinking": "step 1 "}});
    let chunks = state.on_event(&d1).expect("event");
    assert_eq!(chunks, vec![StreamChunk::Reasoning { text: "step 1 ".to_string() }]);

    let d2 = json!({"type": "content_block_delta", "index": 0,
      "delta": {"type": "thinking_delta", "thinking": "step 2"}});
    state.on_event(&d2).expect("event");

    let sig = json!({"type": "content_block_delta", "index": 0,
      "delta": {"type": "signature_delta", "signature": "sig=="}});
    let chunks = state.on_event(&sig).expect("event");
    assert_eq!(
      chunks,
      vec![StreamChunk::Thinking {
        thinking: "step 1 step 2".to_string(),
        signature: "sig==".to_string(),
      }]
    );
  }

  #[test]
  fn test_usage_accumulates_across_events() {
    let mut state = MessageState::default();
    let start = json!({"type": "message_start", "message": {"usage": {
      "input_tokens": 100, "output_tokens": 1, "cache_read_input_tokens": 30}}});
    state.on_event(&start).expect("event");
    let delta = json!({"type": "message_delta", "usage": {"output_tokens": 42}});
    state.on_event(&delta).expect("event");

    assert_eq!(state.usage.input_tokens, 100);
    assert_eq!(state.usage.output_tokens, 42);
    assert_eq!(state.usage.cache_read_tokens, Some(30));
  }

  #[test]
  fn test_second_text_block_inserts_line_break() {
    let mut state = MessageState::default();
    let first = json!({"type": "content_block_start", "index": 0,
      "content_block": {"type": "text", "text": ""}});
    assert!(state.on_event(&first).expect("event").is_empty());
    let second = json!({"type": "content_block_start", "index": 1,
      "content_block": {"type": "text", "text": ""}});
    let chunks = state.on_event(&second).expect("event");
    assert_eq!(chunks, vec![StreamChunk::Text { text: "\n".to_string() }]);
  }

  #[test]
  fn test_redacted_thinking_passthrough() {
    let mut state = MessageState::default();
    let event = json!({"type": "content_block_start", "index": 0,
      "content_block": {"type": "redacted_thinking", "data": "opaque=="}});
    let chunks = state.on_event(&event).expect("event");
    assert_eq!(chunks, vec![StreamChunk::RedactedThinking { data: "opaque==".to_string() }]);
  }

  #[test]
  fn test_tool_use_blocks_map_to_partials() {
    let mut state = MessageState::default();
    let start = json!({"type": "content_block_start", "index": 1,
      "content_block": {"type": "tool_use", "id": "toolu_1", "name": "read_file"}});
    let chunks = state.on_event(&start).expect("event");
    assert!(matches!(
      &chunks[0],
      StreamChunk::ToolCallPartial { index: 0, id: Some(_), name: Some(_), arguments: None }
    ));

    let delta = json!({"type": "content_block_delta", "index": 1,
      "delta": {"type": "input_json_delta", "partial_json": "{\"p\":1}"}});
    let chunks = state.on_event(&delta).expect("event");
    assert_eq!(
      chunks,
      vec![StreamChunk::ToolCallPartial {
        index: 0,
        id: None,
        name: None,
        arguments: Some("{\"p\":1}".to_string()),
      }]
    );
  }

  #[test]
  fn test_error_event_raises() {
    let mut state = MessageState::default();
    let event = json!({"type": "error", "error": {"message": "overloaded"}});
    assert!(state.on_event(&event).is_err());
  }
}
