//! OpenRouter aggregator adapter, plus the KiloCode wrapper.
//!
//! OpenRouter reports failures as an `error` object inside a 200 body or a
//! stream event, so every decoded payload is sniffed before use. Its usage
//! snapshot carries the upstream inference provider and an exact dollar cost,
//! which takes precedence over the locally computed one.

use async_trait::async_trait;
use futures::{StreamExt, pin_mut};
use reqwest::Client;
use serde_json::{Value, json};
use std::collections::HashMap;

use super::{
  LlmAdapter, apply_tool_protocol, chat_delta_chunks, create_client, embedded_error,
  extract_completion_text, flush_think_tags, openai_messages, openai_tool_choice, openai_tools,
  parse_usage_snapshot, scan_think_tags,
};
use crate::error::{ProviderError, Result};
use crate::model::{
  KILOCODE_DEFAULT_MODEL, OPENROUTER_DEFAULT_MODEL, ModelDescriptor, ResolvedModel, lookup_model,
  openrouter_models,
};
use crate::params::{ParamsFormat, ReasoningConfig, resolve_params};
use crate::sse::sse_event_stream;
use crate::stream::{ChunkStream, StreamChunk, UsageChunk};
use crate::think::ThinkTagScanner;
use crate::types::{Message, ProviderSettings, RequestMetadata};
use crate::usage::with_cost;

const PROVIDER: &str = "openrouter";
const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
const KILOCODE_BASE_URL: &str = "https://kilocode.ai/api/openrouter";

pub struct OpenRouterAdapter {
  settings: ProviderSettings,
  models: HashMap<String, ModelDescriptor>,
  client: Client,
  default_model: &'static str,
}

impl OpenRouterAdapter {
  pub fn new(settings: ProviderSettings) -> Self {
    Self::with_default_model(settings, OPENROUTER_DEFAULT_MODEL)
  }

  fn with_default_model(settings: ProviderSettings, default_model: &'static str) -> Self {
    let client = create_client(settings.timeout);
    Self {
      settings,
      models: openrouter_models(),
      client,
      default_model,
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

  fn send(&self, body: &Value) -> reqwest::RequestBuilder {
    self
      .client
      .post(self.completions_url())
      .bearer_auth(self.settings.api_key.clone().unwrap_or_default())
      .header("HTTP-Referer", "https://github.com/llmux")
      .header("X-Title", "llmux")
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
      "messages": openai_messages(system_prompt, messages),
      "stream": stream,
      "usage": {"include": true},
    });
    if let Some(temperature) = model.params.temperature {
      body["temperature"] = json!(temperature);
    }
    if let Some(max) = model.params.max_tokens {
      body["max_tokens"] = json!(max);
    }
    match &model.params.reasoning {
      Some(ReasoningConfig::Budget { budget_tokens }) => {
        body["reasoning"] = json!({"max_tokens": budget_tokens});
      }
      Some(ReasoningConfig::Effort { effort }) => {
        body["reasoning"] = json!({"effort": effort});
      }
      None => {}
    }
    if let Some(tools) = openai_tools(metadata) {
      body["tools"] = tools;
      if let Some(choice) = &metadata.tool_choice {
        body["tool_choice"] = openai_tool_choice(choice);
      }
    }
    body
  }
}

#[async_trait]
impl LlmAdapter for OpenRouterAdapter {
  fn get_model(&self) -> ResolvedModel {
    let (id, info) = lookup_model(
      &self.models,
      self.settings.model_id.as_deref(),
      self.default_model,
    );
    let params = resolve_params(ParamsFormat::OpenRouter, &info, &self.settings, None);
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
        if let Some(snapshot) = parse_openrouter_usage(&value) {
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
        let reconciled = if snapshot.total_cost.is_some() {
          snapshot
        } else {
          with_cost(&model.info, snapshot)
        };
        yield StreamChunk::Usage(reconciled);
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

/// Usage snapshot enriched with OpenRouter's exact cost and upstream provider.
fn parse_openrouter_usage(value: &Value) -> Option<UsageChunk> {
  let mut usage = parse_usage_snapshot(value)?;
  usage.total_cost = value
    .get("usage")
    .and_then(|u| u.get("cost"))
    .and_then(Value::as_f64);
  usage.inference_provider = value
    .get("provider")
    .and_then(Value::as_str)
    .map(ToString::to_string);
  Some(usage)
}

/// KiloCode gateway: OpenRouter's wire against a different host and default
/// model. Composition, not inheritance: the wrapper owns a configured
/// [OpenRouterAdapter] and delegates everything to it.
pub struct KiloCodeAdapter {
  inner: OpenRouterAdapter,
}

impl KiloCodeAdapter {
  pub fn new(mut settings: ProviderSettings) -> Self {
    if settings.base_url.is_none() {
      settings.base_url = Some(KILOCODE_BASE_URL.to_string());
    }
    Self {
      inner: OpenRouterAdapter::with_default_model(settings, KILOCODE_DEFAULT_MODEL),
    }
  }
}

#[async_trait]
impl LlmAdapter for KiloCodeAdapter {
  fn get_model(&self) -> ResolvedModel {
    self.inner.get_model()
  }

  async fn create_message(
    &self,
    system_prompt: &str,
    messages: &[Message],
    metadata: RequestMetadata,
  ) -> Result<ChunkStream> {
    self.inner.create_message(system_prompt, messages, metadata).await
  }

  async fn complete_prompt(&self, prompt: &str) -> Result<String> {
    self.inner.complete_prompt(prompt).await
  }
}
