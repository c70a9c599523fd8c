//! GitHub Copilot adapter and token exchange.
//!
//! Copilot API calls require a short-lived service token obtained from the
//! user's OAuth token. Gateways differ in where that exchange endpoint lives
//! and which method/auth-scheme it accepts, so the exchanger walks a candidate
//! matrix; a 404/405 means "not on this host, try the next", and if every
//! candidate says so the raw OAuth token is used directly, which some
//! self-hosted gateways accept.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, Method};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{
  LlmAdapter, apply_tool_protocol, chat_delta_chunks, create_client, embedded_error,
  extract_completion_text, openai_messages, openai_tool_choice, openai_tools,
  parse_usage_snapshot,
};
use futures::{StreamExt, pin_mut};
use serde_json::json;

use crate::error::{ProviderError, Result};
use crate::model::{COPILOT_DEFAULT_MODEL, ModelDescriptor, ResolvedModel, lookup_model, openai_models};
use crate::params::{ParamsFormat, resolve_params};
use crate::sse::sse_event_stream;
use crate::stream::{ChunkStream, StreamChunk, UsageChunk};
use crate::types::{Message, ProviderSettings, RequestMetadata};
use crate::usage::with_cost;

const PROVIDER: &str = "copilot";
const DEFAULT_API_BASE: &str = "https://api.githubcopilot.com";
const REFRESH_BUFFER_SECS: i64 = 60;

const DEFAULT_TOKEN_ENDPOINTS: &[&str] = &[
  "https://api.github.com/copilot_internal/v2/token",
  "https://api.githubcopilot.com/copilot_internal/v2/token",
];

/// Exchanged service token with its refresh schedule.
#[derive(Debug, Clone)]
pub struct CopilotToken {
  pub token: String,
  pub expires_at: Option<DateTime<Utc>>,
  pub refresh_at: Option<DateTime<Utc>>,
}

impl CopilotToken {
  /// True when within the refresh buffer of `refresh_at`/`expires_at`.
  pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
    let deadline = self.refresh_at.or(self.expires_at);
    match deadline {
      Some(deadline) => now + Duration::seconds(REFRESH_BUFFER_SECS) >= deadline,
      // Degraded raw-OAuth tokens never expire on our side
      None => false,
    }
  }
}

/// Token-exchange state machine.
pub struct CopilotTokenExchanger {
  client: Client,
  endpoints: Vec<String>,
}

impl CopilotTokenExchanger {
  pub fn new() -> Self {
    Self::with_endpoints(
      DEFAULT_TOKEN_ENDPOINTS
        .iter()
        .map(ToString::to_string)
        .collect(),
    )
  }

  pub fn with_endpoints(endpoints: Vec<String>) -> Self {
    Self {
      client: create_client(Some(30)),
      endpoints,
    }
  }

  /// Exchanges an OAuth token for a Copilot service token.
  ///
  /// Walks every endpoint with both `GET`/`POST` and both `token`/`Bearer`
  /// schemes. If every candidate answers 404/405 the original OAuth token is
  /// returned verbatim; any other failure class surfaces as the first
  /// meaningful error encountered.
  pub async fn fetch_copilot_token(&self, oauth_token: &str) -> Result<CopilotToken> {
    let mut first_error: Option<ProviderError> = None;

    for endpoint in &self.endpoints {
      for method in [Method::GET, Method::POST] {
        for scheme in ["token", "Bearer"] {
          let request = self
            .client
            .request(method.clone(), endpoint)
            .header("Authorization", format!("{scheme} {oauth_token}"))
            .header("Accept", "application/json");

          let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
              if first_error.is_none() {
                first_error = Some(ProviderError::Network(err));
              }
              continue;
            }
          };

          let status = response.status().as_u16();
          if status == 404 || status == 405 {
            continue;
          }
          let body = response.text().await.unwrap_or_default();
          if !(200..300).contains(&status) {
            if first_error.is_none() {
              first_error = Some(ProviderError::from_http(PROVIDER, status, &body));
            }
            continue;
          }

          match parse_token_response(&body) {
            Some(token) => {
              debug!(endpoint = %endpoint, "copilot token exchanged");
              return Ok(token);
            }
            None => {
              if first_error.is_none() {
                first_error = Some(ProviderError::InvalidResponse(
                  "copilot token response missing token field".to_string(),
                ));
              }
            }
          }
        }
      }
    }

    match first_error {
      Some(err) => Err(err),
      None => {
        // Every endpoint 404/405'd; the gateway takes the OAuth token as-is
        warn!("no copilot token endpoint found, using oauth token directly");
        Ok(CopilotToken {
          token: oauth_token.to_string(),
          expires_at: None,
          refresh_at: None,
        })
      }
    }
  }
}

impl Default for CopilotTokenExchanger {
  fn default() -> Self {
    Self::new()
  }
}

fn parse_token_response(body: &str) -> Option<CopilotToken> {
  let value: Value = serde_json::from_str(body).ok()?;
  let token = value.get("token")?.as_str()?.to_string();
  let expires_at = value
    .get("expires_at")
    .and_then(Value::as_i64)
    .and_then(|secs| DateTime::from_timestamp(secs, 0));
  let refresh_at = value
    .get("refresh_in")
    .and_then(Value::as_i64)
    .map(|secs| Utc::now() + Duration::seconds(secs));
  Some(CopilotToken {
    token,
    expires_at,
    refresh_at,
  })
}

pub struct CopilotAdapter {
  settings: ProviderSettings,
  models: HashMap<String, ModelDescriptor>,
  client: Client,
  exchanger: CopilotTokenExchanger,
  cached: RwLock<Option<CopilotToken>>,
}

impl CopilotAdapter {
  pub fn new(settings: ProviderSettings) -> Self {
    Self::with_exchanger(settings, CopilotTokenExchanger::new())
  }

  pub fn with_exchanger(settings: ProviderSettings, exchanger: CopilotTokenExchanger) -> Self {
    let client = create_client(settings.timeout);
    Self {
      settings,
      models: openai_models(),
      client,
      exchanger,
      cached: RwLock::new(None),
    }
  }

  fn completions_url(&self) -> String {
    let base = self
      .settings
      .base_url
      .clone()
      .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
    format!("{}/chat/completions", base.trim_end_matches('/'))
  }

  fn oauth_token(&self) -> String {
    self.settings.api_key.clone().unwrap_or_default()
  }

  /// Cached service token, exchanged or refreshed as needed.
  async fn service_token(&self, force: bool) -> Result<String> {
    if !force {
      let cached = self.cached.read().await;
      if let Some(token) = cached.as_ref() {
        if !token.needs_refresh(Utc::now()) {
          return Ok(token.token.clone());
        }
      }
    }

    let token = self.exchanger.fetch_copilot_token(&self.oauth_token()).await?;
    let value = token.token.clone();
    *self.cached.write().await = Some(token);
    Ok(value)
  }

  async fn send_request(&self, body: &Value) -> Result<reqwest::Response> {
    let token = self.service_token(false).await?;
    let response = self.dispatch(body, &token).await?;
    // A stale token earns exactly one refresh-and-retry
    if matches!(response.status().as_u16(), 401 | 403) {
      let token = self.service_token(true).await?;
      return self.dispatch(body, &token).await;
    }
    Ok(response)
  }

  async fn dispatch(&self, body: &Value, token: &str) -> Result<reqwest::Response> {
    Ok(
      self
        .client
        .post(self.completions_url())
        .bearer_auth(token)
        .header("Copilot-Integration-Id", "vscode-chat")
        .header("Editor-Version", "vscode/1.99.0")
        .json(body)
        .send()
        .await?,
    )
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
      body["temperature"] = json!(temperature);
    }
    if let Some(max) = model.params.max_tokens {
      body["max_tokens"] = json!(max);
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
impl LlmAdapter for CopilotAdapter {
  fn get_model(&self) -> ResolvedModel {
    let (id, info) = lookup_model(
      &self.models,
      self.settings.model_id.as_deref(),
      COPILOT_DEFAULT_MODEL,
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
    let response = self.send_request(&body).await?;

    let events = sse_event_stream(PROVIDER, response);
    let stream: ChunkStream = Box::pin(async_stream::try_stream! {
      pin_mut!(events);
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
        for chunk in chat_delta_chunks(&value) {
          yield chunk;
        }
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

    let response = self.send_request(&body).await?;
    let status = response.status();
    let text = response.text().await?;
    if !status.is_success() {
      return Err(ProviderError::from_http(PROVIDER, status.as_u16(), &text));
    }
    let value: Value = serde_json::from_str(&text)?;
    Ok(extract_completion_text(&value))
  }
}
