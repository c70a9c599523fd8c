//! AWS Bedrock adapter and inference-profile resolver.
//!
//! Talks to the Converse / ConverseStream runtime endpoints over HTTP with a
//! Bedrock API key; the streaming response arrives as binary eventstream
//! frames decoded by [crate::eventstream]. Inference-profile ARNs are resolved
//! through the control plane once and cached; on any control-plane failure the
//! resolver degrades to `None` and the adapter falls back to heuristic model
//! detection from the ARN string, so restrictive IAM policies still get a
//! working model.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{Value, json};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{LlmAdapter, apply_tool_protocol, create_client};
use crate::error::{ProviderError, Result};
use crate::eventstream::EventStreamDecoder;
use crate::model::{BEDROCK_DEFAULT_MODEL, ModelDescriptor, ResolvedModel, bedrock_models, lookup_model};
use crate::params::{ParamsFormat, ReasoningConfig, resolve_params};
use crate::stream::{ChunkStream, StreamChunk, UsageChunk};
use crate::types::{Message, ProviderSettings, RequestMetadata};
use crate::usage::with_cost;

const PROVIDER: &str = "bedrock";
const DEFAULT_REGION: &str = "us-east-1";

/// Resolution result for one inference-profile ARN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedProfile {
  pub model_id: String,
  pub model_arn: String,
}

/// Control-plane seam, mocked in tests.
#[async_trait]
pub trait ProfileLookup: Send + Sync {
  /// `GetInferenceProfile` response body.
  async fn get_inference_profile(&self, arn: &str) -> Result<Value>;
}

/// HTTP control-plane client.
pub struct HttpProfileLookup {
  client: Client,
  base_url: String,
  api_key: String,
}

impl HttpProfileLookup {
  pub fn new(region: &str, api_key: String) -> Self {
    Self {
      client: create_client(Some(30)),
      base_url: format!("https://bedrock.{region}.amazonaws.com"),
      api_key,
    }
  }
}

#[async_trait]
impl ProfileLookup for HttpProfileLookup {
  async fn get_inference_profile(&self, arn: &str) -> Result<Value> {
    let encoded: String = url::form_urlencoded::byte_serialize(arn.as_bytes()).collect();
    let response = self
      .client
      .get(format!("{}/inference-profiles/{encoded}", self.base_url))
      .bearer_auth(&self.api_key)
      .send()
      .await?;
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
      return Err(ProviderError::from_http(PROVIDER, status.as_u16(), &body));
    }
    Ok(serde_json::from_str(&body)?)
  }
}

/// Caching resolver for inference-profile ARNs.
pub struct BedrockProfileResolver {
  lookup: Box<dyn ProfileLookup>,
  cache: RwLock<HashMap<String, ResolvedProfile>>,
}

impl BedrockProfileResolver {
  pub fn new(lookup: Box<dyn ProfileLookup>) -> Self {
    Self {
      lookup,
      cache: RwLock::new(HashMap::new()),
    }
  }

  /// Only inference-profile resource types go through the control plane.
  pub fn should_resolve_arn(arn: &str) -> bool {
    let Some(resource) = arn.strip_prefix("arn:").and_then(|rest| {
      // arn:partition:service:region:account:resource-type/resource-id
      rest.splitn(5, ':').nth(4)
    }) else {
      return false;
    };
    let resource_type = resource.split('/').next().unwrap_or_default();
    matches!(
      resource_type,
      "application-inference-profile" | "inference-profile"
    )
  }

  /// Resolves an ARN to its underlying model; `None` on any failure.
  ///
  /// Success results cache indefinitely until [Self::clear_cache]; failures
  /// are not cached so a later call can succeed.
  pub async fn resolve_profile(&self, arn: &str) -> Option<ResolvedProfile> {
    if let Some(hit) = self.cache.read().await.get(arn) {
      return Some(hit.clone());
    }

    let response = match self.lookup.get_inference_profile(arn).await {
      Ok(response) => response,
      Err(err) => {
        warn!(arn = %arn, error = %err, "inference profile resolution failed");
        return None;
      }
    };

    let model = response
      .get("models")
      .and_then(Value::as_array)
      .and_then(|models| models.first())?;
    let model_arn = model.get("modelArn").and_then(Value::as_str)?.to_string();
    let model_id = model_arn.rsplit('/').next()?.to_string();

    let resolved = ResolvedProfile { model_id, model_arn };
    self
      .cache
      .write()
      .await
      .insert(arn.to_string(), resolved.clone());
    debug!(arn = %arn, model = %resolved.model_id, "inference profile resolved");
    Some(resolved)
  }

  pub async fn clear_cache(&self) {
    self.cache.write().await.clear();
  }
}

/// Best-effort model id from an ARN when resolution is unavailable.
pub fn model_id_from_arn(arn: &str) -> String {
  let resource_id = arn.rsplit('/').next().unwrap_or(arn);
  // Cross-region profile ids carry a geo prefix ("us.", "eu.", "apac.")
  for prefix in ["us.", "eu.", "apac."] {
    if let Some(stripped) = resource_id.strip_prefix(prefix) {
      return stripped.to_string();
    }
  }
  resource_id.to_string()
}

pub struct BedrockAdapter {
  settings: ProviderSettings,
  models: HashMap<String, ModelDescriptor>,
  client: Client,
  resolver: BedrockProfileResolver,
}

impl BedrockAdapter {
  pub fn new(settings: ProviderSettings) -> Self {
    let region = settings.region.clone().unwrap_or_else(|| DEFAULT_REGION.to_string());
    let lookup = HttpProfileLookup::new(&region, settings.api_key.clone().unwrap_or_default());
    Self::with_lookup(settings, Box::new(lookup))
  }

  pub fn with_lookup(settings: ProviderSettings, lookup: Box<dyn ProfileLookup>) -> Self {
    let client = create_client(settings.timeout);
    Self {
      settings,
      models: bedrock_models(),
      client,
      resolver: BedrockProfileResolver::new(lookup),
    }
  }

  pub fn resolver(&self) -> &BedrockProfileResolver {
    &self.resolver
  }

  fn region(&self) -> String {
    self.settings.region.clone().unwrap_or_else(|| DEFAULT_REGION.to_string())
  }

  fn runtime_url(&self, model_id: &str, stream: bool) -> String {
    let base = self
      .settings
      .base_url
      .clone()
      .unwrap_or_else(|| format!("https://bedrock-runtime.{}.amazonaws.com", self.region()));
    let encoded: String = url::form_urlencoded::byte_serialize(model_id.as_bytes()).collect();
    let op = if stream { "converse-stream" } else { "converse" };
    format!("{}/model/{encoded}/{op}", base.trim_end_matches('/'))
  }

  /// Effective runtime model id, resolving inference-profile ARNs.
  async fn effective_model_id(&self) -> String {
    let configured = self
      .settings
      .model_id
      .clone()
      .unwrap_or_else(|| BEDROCK_DEFAULT_MODEL.to_string());
    if !configured.starts_with("arn:") {
      return configured;
    }
    if BedrockProfileResolver::should_resolve_arn(&configured) {
      if let Some(resolved) = self.resolver.resolve_profile(&configured).await {
        return resolved.model_id;
      }
    }
    model_id_from_arn(&configured)
  }

  fn build_body(
    &self,
    model: &ResolvedModel,
    system_prompt: &str,
    messages: &[Message],
    metadata: &RequestMetadata,
  ) -> Value {
    let mut body = json!({
      "messages": converse_messages(messages),
      "inferenceConfig": {
        "maxTokens": model.params.max_tokens.unwrap_or(model.info.max_tokens),
      },
    });
    if !system_prompt.is_empty() {
      body["system"] = json!([{"text": system_prompt}]);
    }
    match &model.params.reasoning {
      Some(ReasoningConfig::Budget { budget_tokens }) => {
        body["additionalModelRequestFields"] =
          json!({"thinking": {"type": "enabled", "budget_tokens": budget_tokens}});
      }
      _ => {
        if let Some(temperature) = model.params.temperature {
          body["inferenceConfig"]["temperature"] = json!(temperature);
        }
      }
    }
    if let Some(tools) = metadata.native_tools() {
      let tools: Vec<Value> = tools
        .iter()
        .map(|tool| {
          json!({"toolSpec": {
            "name": tool.function.name,
            "description": tool.function.description,
            "inputSchema": {"json": tool.function.parameters},
          }})
        })
        .collect();
      body["toolConfig"] = json!({"tools": tools});
    }
    body
  }

  async fn post(&self, url: String, body: &Value) -> Result<reqwest::Response> {
    Ok(
      self
        .client
        .post(url)
        .bearer_auth(self.settings.api_key.clone().unwrap_or_default())
        .json(body)
        .send()
        .await?,
    )
  }
}

#[async_trait]
impl LlmAdapter for BedrockAdapter {
  fn get_model(&self) -> ResolvedModel {
    let configured = self.settings.model_id.as_deref();
    // ARNs resolve asynchronously at request time; descriptor lookup here
    // uses the heuristic id
    let lookup_id = configured
      .filter(|id| id.starts_with("arn:"))
      .map(model_id_from_arn);
    let (id, info) = lookup_model(
      &self.models,
      lookup_id.as_deref().or(configured),
      BEDROCK_DEFAULT_MODEL,
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
    let runtime_id = self.effective_model_id().await;
    let body = self.build_body(&model, system_prompt, messages, &metadata);
    let response = self.post(self.runtime_url(&runtime_id, true), &body).await?;

    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(ProviderError::from_http(PROVIDER, status.as_u16(), &body));
    }

    let stream: ChunkStream = Box::pin(async_stream::try_stream! {
      let mut decoder = EventStreamDecoder::new();
      let mut state = ConverseState::default();
      let mut bytes = response.bytes_stream();

      while let Some(segment) = bytes.next().await {
        let segment = segment.map_err(|e| ProviderError::Stream(format!("{PROVIDER}: {e}")))?;
        for frame in decoder.push(&segment)? {
          if let Some(exception) = frame.exception_type() {
            let message = serde_json::from_slice::<Value>(&frame.payload)
              .ok()
              .and_then(|v| v.get("message").and_then(Value::as_str).map(ToString::to_string))
              .unwrap_or_else(|| exception.to_string());
            Err(ProviderError::VendorProtocol {
              provider: PROVIDER.to_string(),
              message,
              code: Some(exception.to_string()),
            })?;
          }
          let Some(event_type) = frame.event_type().map(ToString::to_string) else {
            continue;
          };
          let payload: Value = match serde_json::from_slice(&frame.payload) {
            Ok(payload) => payload,
            Err(_) => continue,
          };
          for chunk in state.on_event(&event_type, &payload) {
            yield chunk;
          }
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
    let runtime_id = self.effective_model_id().await;
    let messages = vec![Message::user(prompt)];
    let body = self.build_body(&model, "", &messages, &RequestMetadata::default());

    let response = self.post(self.runtime_url(&runtime_id, false), &body).await?;
    let status = response.status();
    let text = response.text().await?;
    if !status.is_success() {
      return Err(ProviderError::from_http(PROVIDER, status.as_u16(), &text));
    }
    let value: Value = serde_json::from_str(&text)?;
    let content = value
      .get("output")
      .and_then(|o| o.get("message"))
      .and_then(|m| m.get("content"))
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

/// Per-request ConverseStream state.
#[derive(Debug, Default)]
struct ConverseState {
  usage: UsageChunk,
  /// contentBlockIndex -> tool ordinal
  tool_indexes: HashMap<u64, u32>,
}

impl ConverseState {
  fn on_event(&mut self, event_type: &str, payload: &Value) -> Vec<StreamChunk> {
    let mut chunks = Vec::new();
    match event_type {
      "contentBlockStart" => {
        let index = payload
          .get("contentBlockIndex")
          .and_then(Value::as_u64)
          .unwrap_or(0);
        if let Some(tool) = payload.get("start").and_then(|s| s.get("toolUse")) {
          let ordinal = self.tool_indexes.len() as u32;
          self.tool_indexes.insert(index, ordinal);
          chunks.push(StreamChunk::ToolCallPartial {
            index: ordinal,
            id: tool.get("toolUseId").and_then(Value::as_str).map(ToString::to_string),
            name: tool.get("name").and_then(Value::as_str).map(ToString::to_string),
            arguments: None,
          });
        }
      }
      "contentBlockDelta" => {
        let index = payload
          .get("contentBlockIndex")
          .and_then(Value::as_u64)
          .unwrap_or(0);
        let Some(delta) = payload.get("delta") else {
          return chunks;
        };
        if let Some(text) = delta.get("text").and_then(Value::as_str) {
          chunks.push(StreamChunk::Text { text: text.to_string() });
        }
        if let Some(text) = delta
          .get("reasoningContent")
          .and_then(|r| r.get("text"))
          .and_then(Value::as_str)
        {
          chunks.push(StreamChunk::Reasoning { text: text.to_string() });
        }
        if let Some(input) = delta
          .get("toolUse")
          .and_then(|t| t.get("input"))
          .and_then(Value::as_str)
        {
          let ordinal = self.tool_indexes.get(&index).copied().unwrap_or(0);
          chunks.push(StreamChunk::ToolCallPartial {
            index: ordinal,
            id: None,
            name: None,
            arguments: Some(input.to_string()),
          });
        }
      }
      "metadata" => {
        if let Some(usage) = payload.get("usage") {
          self.usage.input_tokens = usage
            .get("inputTokens")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;
          self.usage.output_tokens = usage
            .get("outputTokens")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;
          self.usage.cache_read_tokens = usage
            .get("cacheReadInputTokens")
            .and_then(Value::as_u64)
            .map(|t| t as u32);
          self.usage.cache_write_tokens = usage
            .get("cacheWriteInputTokens")
            .and_then(Value::as_u64)
            .map(|t| t as u32);
        }
      }
      _ => {}
    }
    chunks
  }
}

fn converse_messages(messages: &[Message]) -> Vec<Value> {
  let mut out = Vec::with_capacity(messages.len());
  for message in messages {
    match message {
      Message::System { content } | Message::User { content } => {
        out.push(json!({"role": "user", "content": [{"text": content}]}));
      }
      Message::Assistant {
        content,
        tool_calls,
      } => {
        let mut blocks = Vec::new();
        if !content.is_empty() {
          blocks.push(json!({"text": content}));
        }
        for call in tool_calls {
          let input: Value =
            serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| json!({}));
          blocks.push(json!({"toolUse": {
            "toolUseId": call.id,
            "name": call.function.name,
            "input": input,
          }}));
        }
        out.push(json!({"role": "assistant", "content": blocks}));
      }
      Message::Tool {
        tool_call_id,
        content,
      } => {
        out.push(json!({"role": "user", "content": [{"toolResult": {
          "toolUseId": tool_call_id,
          "content": [{"text": content}],
        }}]}));
      }
    }
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;
  use std::sync::atomic::{AtomicUsize, Ordering};

  struct CountingLookup {
    calls: Arc<AtomicUsize>,
    response: Result<Value>,
  }

  #[async_trait]
  impl ProfileLookup for CountingLookup {
    async fn get_inference_profile(&self, _arn: &str) -> Result<Value> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      match &self.response {
        Ok(value) => Ok(value.clone()),
        Err(_) => Err(ProviderError::Config("lookup denied".to_string())),
      }
    }
  }

  fn profile_response() -> Value {
    json!({"models": [{
      "modelArn": "arn:aws:bedrock:us-east-1::foundation-model/anthropic.claude-sonnet-4-20250514-v1:0"
    }]})
  }

  #[test]
  fn test_should_resolve_arn_gating() {
    assert!(BedrockProfileResolver::should_resolve_arn(
      "arn:aws:bedrock:us-east-1:123456789012:application-inference-profile/abc123"
    ));
    assert!(BedrockProfileResolver::should_resolve_arn(
      "arn:aws:bedrock:us-east-1:123456789012:inference-profile/us.anthropic.claude-sonnet-4-20250514-v1:0"
    ));
    assert!(!BedrockProfileResolver::should_resolve_arn(
      "arn:aws:bedrock:us-east-1::foundation-model/anthropic.claude-sonnet-4-20250514-v1:0"
    ));
    assert!(!BedrockProfileResolver::should_resolve_arn(
      "arn:aws:bedrock:us-east-1:123456789012:provisioned-model/xyz"
    ));
    assert!(!BedrockProfileResolver::should_resolve_arn("not-an-arn"));
  }

  #[tokio::test]
  async fn test_resolver_caches_until_cleared() {
    let calls = Arc::new(AtomicUsize::new(0));
    let resolver = BedrockProfileResolver::new(Box::new(CountingLookup {
      calls: calls.clone(),
      response: Ok(profile_response()),
    }));
    let arn = "arn:aws:bedrock:us-east-1:123456789012:application-inference-profile/abc";

    let first = resolver.resolve_profile(arn).await.expect("resolved");
    let second = resolver.resolve_profile(arn).await.expect("resolved");
    assert_eq!(first, second);
    assert_eq!(first.model_id, "anthropic.claude-sonnet-4-20250514-v1:0");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    resolver.clear_cache().await;
    resolver.resolve_profile(arn).await.expect("resolved");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_resolver_failure_yields_none() {
    let resolver = BedrockProfileResolver::new(Box::new(CountingLookup {
      calls: Arc::new(AtomicUsize::new(0)),
      response: Err(ProviderError::Config("denied".to_string())),
    }));
    let arn = "arn:aws:bedrock:us-east-1:123456789012:inference-profile/abc";
    assert!(resolver.resolve_profile(arn).await.is_none());
  }

  #[tokio::test]
  async fn test_empty_models_list_yields_none() {
    let resolver = BedrockProfileResolver::new(Box::new(CountingLookup {
      calls: Arc::new(AtomicUsize::new(0)),
      response: Ok(json!({"models": []})),
    }));
    let arn = "arn:aws:bedrock:us-east-1:123456789012:inference-profile/abc";
    assert!(resolver.resolve_profile(arn).await.is_none());
  }

  #[test]
  fn test_heuristic_model_id_from_arn() {
    assert_eq!(
      model_id_from_arn(
        "arn:aws:bedrock:us-east-1:123456789012:inference-profile/us.anthropic.claude-sonnet-4-20250514-v1:0"
      ),
      "anthropic.claude-sonnet-4-20250514-v1:0"
    );
    assert_eq!(model_id_from_arn("plain-model-id"), "plain-model-id");
  }

  #[test]
  fn test_converse_usage_metadata() {
    let mut state = ConverseState::default();
    state.on_event(
      "metadata",
      &json!({"usage": {"inputTokens": 7, "outputTokens": 3, "cacheReadInputTokens": 2}}),
    );
    assert_eq!(state.usage.input_tokens, 7);
    assert_eq!(state.usage.output_tokens, 3);
    assert_eq!(state.usage.cache_read_tokens, Some(2));
  }

  #[test]
  fn test_converse_tool_use_indexing() {
    let mut state = ConverseState::default();
    let start = state.on_event(
      "contentBlockStart",
      &json!({"contentBlockIndex": 1, "start": {"toolUse": {"toolUseId": "t1", "name": "f"}}}),
    );
    assert!(matches!(
      &start[0],
      StreamChunk::ToolCallPartial { index: 0, id: Some(_), .. }
    ));
    let delta = state.on_event(
      "contentBlockDelta",
      &json!({"contentBlockIndex": 1, "delta": {"toolUse": {"input": "{}"}}}),
    );
    assert!(matches!(
      &delta[0],
      StreamChunk::ToolCallPartial { index: 0, arguments: Some(_), .. }
    ));
  }
}
