//! OpenAI-compatible dual-mode adapter.
//!
//! Speaks both the chat-completions wire and the newer Responses API. Which
//! endpoint is used per request is decided by the user's api mode, the
//! responses mode override, and what the configured host/model supports. A
//! dedicated client is kept for Responses calls: the normal client appends
//! Azure's `api-version` query parameter, which the Responses endpoint
//! rejects.

use async_trait::async_trait;
use futures::{StreamExt, pin_mut};
use reqwest::Client;
use serde_json::{Value, json};
use std::collections::HashMap;
use tracing::debug;
use url::Url;

use super::{
  LlmAdapter, apply_tool_protocol, chat_delta_chunks, create_client, embedded_error,
  extract_completion_text, flush_think_tags, openai_messages, openai_tool_choice, openai_tools,
  parse_usage_snapshot, scan_think_tags,
};
use crate::error::{ProviderError, Result};
use crate::model::{OPENAI_DEFAULT_MODEL, ModelDescriptor, ResolvedModel, lookup_model, openai_models};
use crate::params::{ParamsFormat, ReasoningConfig, resolve_params};
use crate::sse::sse_event_stream;
use crate::stream::{ChunkStream, StreamChunk, UsageChunk};
use crate::think::ThinkTagScanner;
use crate::types::{ApiMode, Message, ProviderSettings, RequestMetadata, ResponsesMode};
use crate::usage::with_cost;

const PROVIDER: &str = "openai";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const AZURE_API_VERSION: &str = "2024-10-21";

pub struct OpenAiAdapter {
  settings: ProviderSettings,
  models: HashMap<String, ModelDescriptor>,
  client: Client,
  /// Responses calls only; never carries `api-version`.
  responses_client: Client,
}

impl OpenAiAdapter {
  pub fn new(settings: ProviderSettings) -> Self {
    let client = create_client(settings.timeout);
    let responses_client = create_client(settings.timeout);
    Self {
      settings,
      models: openai_models(),
      client,
      responses_client,
    }
  }

  fn base_url(&self) -> String {
    self
      .settings
      .base_url
      .clone()
      .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
      .trim_end_matches('/')
      .to_string()
  }

  fn completions_url(&self) -> String {
    let base = self.base_url();
    if is_azure_host(&base) {
      format!("{base}/chat/completions?api-version={AZURE_API_VERSION}")
    } else {
      format!("{base}/chat/completions")
    }
  }

  fn should_use_responses(&self, model_id: &str, info: &ModelDescriptor) -> bool {
    let base = self.base_url();
    should_use_responses(
      self.settings.api_mode,
      self.settings.responses_mode,
      supports_responses_api_for_base_url(&base),
      requires_responses_api_for_model(model_id, info),
    )
  }

  fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
    let mut request = request.bearer_auth(self.settings.api_key.clone().unwrap_or_default());
    for (name, value) in &self.settings.headers {
      request = request.header(name, value);
    }
    request
  }

  fn completions_body(
    &self,
    model: &ResolvedModel,
    system_prompt: &str,
    messages: &[Message],
    metadata: &RequestMetadata,
    stream: bool,
  ) -> Value {
    let mut wire = openai_messages(system_prompt, messages);
    if is_deepseek_r1(&model.id) {
      wire = merge_for_deepseek_r1(wire);
    }
    if model.info.supports_prompt_cache {
      insert_cache_breakpoints(&mut wire);
    }

    let mut body = json!({
      "model": model.id,
      "messages": wire,
      "stream": stream,
    });
    if stream {
      body["stream_options"] = json!({"include_usage": true});
    }

    if is_reasoning_family(&model.id) {
      // o1/o3/o4 shape: effort instead of temperature, completion-token cap
      if let Some(ReasoningConfig::Effort { effort }) = &model.params.reasoning {
        body["reasoning_effort"] = json!(effort);
      }
      if let Some(max) = model.params.max_tokens {
        body["max_completion_tokens"] = json!(max);
      }
    } else {
      if let Some(temperature) = model.params.temperature {
        body["temperature"] = json!(temperature);
      }
      if let Some(max) = model.params.max_tokens {
        body["max_tokens"] = json!(max);
      }
    }

    if let Some(tools) = openai_tools(metadata) {
      body["tools"] = tools;
      if let Some(choice) = &metadata.tool_choice {
        body["tool_choice"] = openai_tool_choice(choice);
      }
    }
    body
  }

  fn responses_body(
    &self,
    model: &ResolvedModel,
    system_prompt: &str,
    messages: &[Message],
    metadata: &RequestMetadata,
  ) -> Value {
    let input: Vec<Value> = messages
      .iter()
      .map(|message| match message {
        Message::Tool {
          tool_call_id,
          content,
        } => json!({
          "type": "function_call_output",
          "call_id": tool_call_id,
          "output": content,
        }),
        other => json!({
          "role": other.role(),
          "content": other.text(),
        }),
      })
      .collect();

    let mut body = json!({
      "model": model.id,
      "instructions": system_prompt,
      "input": input,
      "stream": true,
    });
    if let Some(max) = model.params.max_tokens {
      body["max_output_tokens"] = json!(max);
    }
    match &model.params.reasoning {
      Some(ReasoningConfig::Effort { effort }) => {
        body["reasoning"] = json!({"effort": effort});
      }
      _ => {
        if !is_reasoning_family(&model.id) {
          if let Some(temperature) = model.params.temperature {
            body["temperature"] = json!(temperature);
          }
        }
      }
    }
    if let Some(tools) = metadata.native_tools() {
      let tools: Vec<Value> = tools
        .iter()
        .map(|tool| {
          json!({
            "type": "function",
            "name": tool.function.name,
            "description": tool.function.description,
            "parameters": tool.function.parameters,
            "strict": false,
          })
        })
        .collect();
      body["tools"] = Value::Array(tools);
    }
    body
  }

  async fn stream_completions(
    &self,
    model: ResolvedModel,
    body: Value,
  ) -> Result<ChunkStream> {
    let response = self
      .authorize(self.client.post(self.completions_url()).json(&body))
      .send()
      .await?;

    let events = sse_event_stream(PROVIDER, response);
    Ok(Box::pin(async_stream::try_stream! {
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
    }))
  }

  async fn stream_responses(&self, model: ResolvedModel, body: Value) -> Result<ChunkStream> {
    let url = normalize_responses_base_url(&self.base_url());
    debug!(url = %url, model = %model.id, "dispatching responses request");
    let response = self
      .authorize(self.responses_client.post(url).json(&body))
      .send()
      .await?;

    let events = sse_event_stream(PROVIDER, response);
    Ok(Box::pin(async_stream::try_stream! {
      pin_mut!(events);
      let mut usage: Option<UsageChunk> = None;
      // call index -> wire index, assigned in arrival order
      let mut call_indexes: HashMap<String, u32> = HashMap::new();

      while let Some(event) = events.next().await {
        let event = event?;
        if event.done || event.data.is_empty() {
          continue;
        }
        let value: Value = match serde_json::from_str(&event.data) {
          Ok(value) => value,
          Err(_) => continue,
        };
        let event_type = value.get("type").and_then(Value::as_str).unwrap_or_default();

        match event_type {
          "response.output_text.delta" => {
            if let Some(text) = value.get("delta").and_then(Value::as_str) {
              yield StreamChunk::Text { text: text.to_string() };
            }
          }
          "response.reasoning_summary_text.delta" | "response.reasoning_text.delta" => {
            if let Some(text) = value.get("delta").and_then(Value::as_str) {
              yield StreamChunk::Reasoning { text: text.to_string() };
            }
          }
          "response.output_item.added" => {
            let item = value.get("item").cloned().unwrap_or(Value::Null);
            if item.get("type").and_then(Value::as_str) == Some("function_call") {
              let call_id = item
                .get("call_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
              let name = item
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
              let index = call_indexes.len() as u32;
              call_indexes.insert(call_id.clone(), index);
              yield StreamChunk::ToolCallPartial {
                index,
                id: Some(call_id),
                name: Some(name),
                arguments: None,
              };
            }
          }
          "response.function_call_arguments.delta" => {
            let call_id = value.get("call_id").and_then(Value::as_str).unwrap_or_default();
            let index = call_indexes.get(call_id).copied().unwrap_or(0);
            if let Some(arguments) = value.get("delta").and_then(Value::as_str) {
              yield StreamChunk::ToolCallPartial {
                index,
                id: None,
                name: None,
                arguments: Some(arguments.to_string()),
              };
            }
          }
          "response.completed" => {
            if let Some(response) = value.get("response") {
              if let Some(snapshot) = parse_usage_snapshot(response) {
                usage = Some(snapshot);
              }
            }
          }
          "response.failed" | "error" => {
            let message = value
              .get("response")
              .and_then(|r| r.get("error"))
              .or_else(|| value.get("error"))
              .and_then(|e| e.get("message"))
              .and_then(Value::as_str)
              .unwrap_or("responses stream failed")
              .to_string();
            Err(ProviderError::VendorProtocol {
              provider: PROVIDER.to_string(),
              message,
              code: None,
            })?;
          }
          _ => {}
        }
      }

      if let Some(snapshot) = usage {
        yield StreamChunk::Usage(with_cost(&model.info, snapshot));
      }
    }))
  }
}

#[async_trait]
impl LlmAdapter for OpenAiAdapter {
  fn get_model(&self) -> ResolvedModel {
    let (id, info) = lookup_model(
      &self.models,
      self.settings.model_id.as_deref(),
      OPENAI_DEFAULT_MODEL,
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
    let stream = if self.should_use_responses(&model.id, &model.info) {
      let body = self.responses_body(&model, system_prompt, messages, &metadata);
      self.stream_responses(model, body).await?
    } else {
      let body = self.completions_body(&model, system_prompt, messages, &metadata, true);
      self.stream_completions(model, body).await?
    };
    Ok(apply_tool_protocol(metadata.tool_protocol, stream))
  }

  async fn complete_prompt(&self, prompt: &str) -> Result<String> {
    let model = self.get_model();
    let messages = vec![Message::user(prompt)];
    let body = self.completions_body(&model, "", &messages, &RequestMetadata::default(), false);

    let response = self
      .authorize(self.client.post(self.completions_url()).json(&body))
      .send()
      .await?;
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

/// Endpoint decision for one request.
pub fn should_use_responses(
  api_mode: ApiMode,
  responses_mode: ResponsesMode,
  supports_base_url: bool,
  requires_model: bool,
) -> bool {
  match api_mode {
    ApiMode::Completions => false,
    ApiMode::Responses => match responses_mode {
      ResponsesMode::Force => supports_base_url,
      ResponsesMode::Off => false,
      ResponsesMode::Auto => supports_base_url && requires_model,
    },
  }
}

pub fn supports_responses_api_for_base_url(base_url: &str) -> bool {
  let Ok(url) = Url::parse(base_url) else {
    return false;
  };
  let host = url.host_str().unwrap_or_default();
  host == "api.openai.com" || host.ends_with(".openai.azure.com") || is_azure_host(base_url)
}

pub fn requires_responses_api_for_model(model_id: &str, info: &ModelDescriptor) -> bool {
  model_id.starts_with("codex") || model_id.contains("codex-") || info.id.starts_with("codex")
}

fn is_azure_host(base_url: &str) -> bool {
  Url::parse(base_url)
    .ok()
    .and_then(|url| url.host_str().map(|h| h.contains("azure")))
    .unwrap_or(false)
}

/// Rewrites a base URL into its Responses endpoint.
///
/// Strips Azure's `api-version` query parameter and appends the path the host
/// expects: `/openai/v1/responses` for Azure hosts, `/responses` otherwise.
/// Normalizing an already-normalized URL is a no-op.
pub fn normalize_responses_base_url(base_url: &str) -> String {
  let Ok(mut url) = Url::parse(base_url) else {
    return base_url.to_string();
  };

  let kept: Vec<(String, String)> = url
    .query_pairs()
    .filter(|(name, _)| name != "api-version")
    .map(|(name, value)| (name.into_owned(), value.into_owned()))
    .collect();
  url.set_query(None);
  if !kept.is_empty() {
    let mut pairs = url.query_pairs_mut();
    for (name, value) in &kept {
      pairs.append_pair(name, value);
    }
  }

  let path = url.path().trim_end_matches('/').to_string();
  if path.ends_with("/responses") {
    url.set_path(&path);
    return url.to_string();
  }

  let suffix = if is_azure_host(base_url) && !path.contains("/openai/v1") {
    "/openai/v1/responses"
  } else {
    "/responses"
  };
  url.set_path(&format!("{path}{suffix}"));
  url.to_string()
}

fn is_reasoning_family(model_id: &str) -> bool {
  ["o1", "o3", "o4"].iter().any(|prefix| {
    model_id == *prefix
      || model_id
        .strip_prefix(prefix)
        .is_some_and(|rest| rest.starts_with('-') || rest.starts_with('.'))
  })
}

fn is_deepseek_r1(model_id: &str) -> bool {
  model_id.to_lowercase().contains("deepseek-r1")
}

/// DeepSeek-R1 forbids system messages and consecutive same-role turns:
/// system content becomes the first user message and adjacent same-role
/// messages are merged.
fn merge_for_deepseek_r1(messages: Vec<Value>) -> Vec<Value> {
  let mut out: Vec<Value> = Vec::with_capacity(messages.len());
  for mut message in messages {
    if message.get("role").and_then(Value::as_str) == Some("system") {
      message["role"] = json!("user");
    }
    let role = message
      .get("role")
      .and_then(Value::as_str)
      .unwrap_or_default()
      .to_string();
    let content = message
      .get("content")
      .and_then(Value::as_str)
      .unwrap_or_default()
      .to_string();

    match out.last_mut() {
      Some(prev) if prev.get("role").and_then(Value::as_str) == Some(role.as_str()) => {
        let merged = format!(
          "{}\n{}",
          prev.get("content").and_then(Value::as_str).unwrap_or_default(),
          content
        );
        prev["content"] = json!(merged);
      }
      _ => out.push(message),
    }
  }
  out
}

/// Marks the last two user messages as prompt-cache breakpoints.
fn insert_cache_breakpoints(messages: &mut [Value]) {
  let mut marked = 0;
  for message in messages.iter_mut().rev() {
    if message.get("role").and_then(Value::as_str) != Some("user") {
      continue;
    }
    message["cache_control"] = json!({"type": "ephemeral"});
    marked += 1;
    if marked == 2 {
      break;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn test_should_use_responses_matrix() {
    use ApiMode::*;
    use ResponsesMode::*;
    assert!(!should_use_responses(Completions, Force, true, true));
    assert!(should_use_responses(Responses, Force, true, false));
    assert!(!should_use_responses(Responses, Force, false, true));
    assert!(!should_use_responses(Responses, Off, true, true));
    assert!(should_use_responses(Responses, Auto, true, true));
    assert!(!should_use_responses(Responses, Auto, true, false));
    assert!(!should_use_responses(Responses, Auto, false, true));
  }

  #[test]
  fn test_normalize_responses_base_url_idempotent() {
    let once = normalize_responses_base_url("https://api.openai.com/v1");
    assert_eq!(once, "https://api.openai.com/v1/responses");
    assert_eq!(normalize_responses_base_url(&once), once);

    let azure = normalize_responses_base_url(
      "https://mydeploy.openai.azure.com?api-version=2024-10-21",
    );
    assert_eq!(azure, "https://mydeploy.openai.azure.com/openai/v1/responses");
    assert_eq!(normalize_responses_base_url(&azure), azure);
  }

  #[test]
  fn test_normalize_strips_only_api_version() {
    let url = normalize_responses_base_url("https://host.example.com/v1?api-version=preview&x=1");
    assert!(url.contains("x=1"));
    assert!(!url.contains("api-version"));
    assert!(url.contains("/v1/responses"));
  }

  #[test]
  fn test_reasoning_family_detection() {
    assert!(is_reasoning_family("o3"));
    assert!(is_reasoning_family("o1-preview"));
    assert!(is_reasoning_family("o4-mini"));
    assert!(!is_reasoning_family("gpt-4o"));
    assert!(!is_reasoning_family("o300"));
  }

  #[test]
  fn test_reasoning_family_body_has_no_temperature() {
    let mut settings = ProviderSettings::default();
    settings.model_id = Some("o3".to_string());
    settings.enable_reasoning = true;
    let adapter = OpenAiAdapter::new(settings);
    let model = adapter.get_model();
    let body = adapter.completions_body(&model, "sys", &[Message::user("hi")], &RequestMetadata::default(), true);
    assert!(body.get("temperature").is_none());
    assert_eq!(body["reasoning_effort"], json!("medium"));
    assert!(body.get("max_completion_tokens").is_some());
  }

  #[test]
  fn test_deepseek_r1_merge() {
    let messages = vec![
      json!({"role": "system", "content": "be brief"}),
      json!({"role": "user", "content": "hello"}),
      json!({"role": "user", "content": "again"}),
      json!({"role": "assistant", "content": "hi"}),
    ];
    let merged = merge_for_deepseek_r1(messages);
    assert_eq!(merged.len(), 2);
    assert_eq!(merged[0]["content"], json!("be brief\nhello\nagain"));
    assert_eq!(merged[1]["role"], json!("assistant"));
  }

  #[test]
  fn test_cache_breakpoints_on_last_two_user_messages() {
    let mut messages = vec![
      json!({"role": "user", "content": "1"}),
      json!({"role": "assistant", "content": "a"}),
      json!({"role": "user", "content": "2"}),
      json!({"role": "user", "content": "3"}),
    ];
    insert_cache_breakpoints(&mut messages);
    assert!(messages[0].get("cache_control").is_none());
    assert!(messages[2].get("cache_control").is_some());
    assert!(messages[3].get("cache_control").is_some());
  }
}
