//! Cerebras adapter.
//!
//! No vendor SDK: requests go straight over HTTP and the SSE framing is
//! parsed manually. Reasoning models on this host emit literal
//! `<think>...</think>` markers inline, so text is routed through the
//! think-tag scanner; the markers never reach downstream consumers even when
//! a tag is split across several stream chunks. The host rejects temperatures
//! above 1.5, so requests clamp rather than fail.

use async_trait::async_trait;
use futures::{StreamExt, pin_mut};
use reqwest::Client;
use serde_json::{Value, json};
use std::collections::HashMap;

use super::{
  LlmAdapter, apply_tool_protocol, chat_delta_chunks, create_client, embedded_error,
  extract_completion_text, flush_think_tags, openai_messages, openai_tools,
  parse_usage_snapshot, scan_think_tags,
};
use crate::error::{ProviderError, Result};
use crate::model::{CEREBRAS_DEFAULT_MODEL, ModelDescriptor, ResolvedModel, cerebras_models, lookup_model};
use crate::params::{ParamsFormat, resolve_params};
use crate::sse::sse_event_stream;
use crate::stream::{ChunkStream, StreamChunk, UsageChunk};
use crate::think::ThinkTagScanner;
use crate::types::{Message, ProviderSettings, RequestMetadata};
use crate::usage::with_cost;

const PROVIDER: &str = "cerebras";
const DEFAULT_BASE_URL: &str = "https://api.cerebras.ai/v1";
const MAX_TEMPERATURE: f32 = 1.5;

pub struct CerebrasAdapter {
  settings: ProviderSettings,
  models: HashMap<String, ModelDescriptor>,
  client: Client,
}

impl CerebrasAdapter {
  pub fn new(settings: ProviderSettings) -> Self {
    let client = create_client(settings.timeout);
    Self {
      settings,
      models: cerebras_models(),
      client,
    }
  }

  fn completions_url(&self) -> String {
    let base = self
      .settings
      .base_url
      .clone()
      .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
    format!("{}/chat/completions", base.trim_end_matches('/'))
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
      "messages": openai_messages(system_prompt, messages),
      "stream": stream,
    });
    if let Some(temperature) = model.params.temperature {
      body["temperature"] = json!(temperature.min(MAX_TEMPERATURE));
    }
    if let Some(max) = model.params.max_tokens {
      body["max_tokens"] = json!(max);
    }
    if let Some(tools) = openai_tools(metadata) {
      body["tools"] = tools;
    }
    body
  }

  fn send(&self, body: &Value) -> reqwest::RequestBuilder {
    self
      .client
      .post(self.completions_url())
      .bearer_auth(self.settings.api_key.clone().unwrap_or_default())
      .json(body)
  }
}

#[async_trait]
impl LlmAdapter for CerebrasAdapter {
  fn get_model(&self) -> ResolvedModel {
    let (id, info) = lookup_model(
      &self.models,
      self.settings.model_id.as_deref(),
      CEREBRAS_DEFAULT_MODEL,
    );
    let params = resolve_params(ParamsFormat::OpenAi, &info, &self.settings, None);
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
    let response = self.send(&body).send().await?;

    let events = sse_event_stream(PROVIDER, response);
    let stream: ChunkStream = Box::pin(async_stream::try_stream! {
      pin_mut!(events);
      let mut scanner = ThinkTagScanner::new();
      let mut usage: Option<UsageChunk> = None;

      while let Some(event) = events.next().await {
        let event = event?;
        if event.done {
          break;
        }
        if event.data.is_empty() {
          continue;
        }
        let value: Value = match serde_json::from_str(&event.data) {
          Ok(value) => value,
          Err(_) => continue,
        };
        if let Some(err) = embedded_error(PROVIDER, &value) {
          Err(err)?;
        }
        // Terminal event carries the authoritative usage snapshot
        if let Some(snapshot) = parse_usage_snapshot(&value) {
          usage = Some(snapshot);
        }
        for chunk in scan_think_tags(&mut scanner, chat_delta_chunks(&value)) {
          yield chunk;
        }
      }

      for chunk in flush_think_tags(&mut scanner) {
        yield chunk;
      }
      if let Some(snapshot) = usage {
        yield StreamChunk::Usage(with_cost(&model.info, snapshot));
      }
    });
    Ok(apply_tool_protocol(metadata.tool_protocol, stream))
  }

  async fn complete_prompt(&self, prompt: &str) -> Result<String> {
    let model = self.get_model();
    let messages = vec![Message::user(prompt)];
    let body = self.build_body(&model, "", &messages, &RequestMetadata::default(), false);

    let response = self.send(&body).send().await?;
    let status = response.status();
    let text = response.text().await?;
    if !status.is_success() {
      return Err(ProviderError::from_http(PROVIDER, status.as_u16(), &text));
    }
    let value: Value = serde_json::from_str(&text)?;
    if let Some(err) = embedded_error(PROVIDER, &value) {
      return Err(err);
    }
    Ok(extract_completion_text(&value))
  }
}
