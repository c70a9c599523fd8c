//! Live model catalog fetchers.
//!
//! Each fetcher calls the vendor's `/models` endpoint, validates entry shape
//! (malformed entries are skipped, never fatal) and maps vendor fields to
//! [ModelDescriptor]. On any network or parse failure the last successful
//! result is returned, and failing that a hardcoded static table, so catalog
//! unavailability never leaves the caller without a model list. The catalog
//! is an explicitly constructed, injected service.

use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::Result;
use crate::model::{ModelDescriptor, openai_models, openrouter_models};
use crate::providers::create_client;

const OPENROUTER_MODELS_URL: &str = "https://openrouter.ai/api/v1/models";

pub struct ModelCatalog {
  client: Client,
  /// endpoint URL -> last successful table
  cache: RwLock<HashMap<String, HashMap<String, ModelDescriptor>>>,
}

impl ModelCatalog {
  pub fn new() -> Self {
    Self {
      client: create_client(Some(30)),
      cache: RwLock::new(HashMap::new()),
    }
  }

  /// OpenRouter catalog; degrades to cache, then the static table.
  pub async fn openrouter_models(&self, base_url: Option<&str>) -> HashMap<String, ModelDescriptor> {
    let url = base_url
      .map(|base| format!("{}/models", base.trim_end_matches('/')))
      .unwrap_or_else(|| OPENROUTER_MODELS_URL.to_string());
    match self.fetch(&url, None, parse_openrouter_entry).await {
      Ok(models) => models,
      Err(err) => {
        warn!(url = %url, error = %err, "model catalog fetch failed");
        self.degraded(&url, openrouter_models).await
      }
    }
  }

  /// Generic OpenAI-compatible `/models` catalog.
  pub async fn openai_compatible_models(
    &self,
    base_url: &str,
    api_key: Option<&str>,
  ) -> HashMap<String, ModelDescriptor> {
    let url = format!("{}/models", base_url.trim_end_matches('/'));
    match self.fetch(&url, api_key, parse_openai_entry).await {
      Ok(models) => models,
      Err(err) => {
        warn!(url = %url, error = %err, "model catalog fetch failed");
        self.degraded(&url, openai_models).await
      }
    }
  }

  async fn fetch(
    &self,
    url: &str,
    api_key: Option<&str>,
    parse: fn(&Value) -> Option<ModelDescriptor>,
  ) -> Result<HashMap<String, ModelDescriptor>> {
    let mut request = self.client.get(url);
    if let Some(key) = api_key {
      request = request.bearer_auth(key);
    }
    let response = request.send().await?.error_for_status()?;
    let body: CatalogResponse = response.json().await?;

    let mut models = HashMap::new();
    for entry in &body.data {
      match parse(entry) {
        Some(info) => {
          models.insert(info.id.clone(), info);
        }
        None => {
          warn!(entry = %entry, "skipping malformed catalog entry");
        }
      }
    }
    debug!(url = %url, count = models.len(), "model catalog fetched");

    self.cache.write().await.insert(url.to_string(), models.clone());
    Ok(models)
  }

  async fn degraded(
    &self,
    url: &str,
    fallback: fn() -> HashMap<String, ModelDescriptor>,
  ) -> HashMap<String, ModelDescriptor> {
    if let Some(cached) = self.cache.read().await.get(url) {
      return cached.clone();
    }
    fallback()
  }
}

impl Default for ModelCatalog {
  fn default() -> Self {
    Self::new()
  }
}

#[derive(Debug, Deserialize)]
struct CatalogResponse {
  #[serde(default)]
  data: Vec<Value>,
}

fn parse_openrouter_entry(entry: &Value) -> Option<ModelDescriptor> {
  let id = entry.get("id")?.as_str()?.to_string();
  let context_window = entry.get("context_length").and_then(Value::as_u64)? as u32;
  let max_tokens = entry
    .get("top_provider")
    .and_then(|p| p.get("max_completion_tokens"))
    .and_then(Value::as_u64)
    .map(|t| t as u32)
    .unwrap_or(context_window / 2);

  // Pricing is dollars per token as strings
  let per_token = |field: &str| {
    entry
      .get("pricing")
      .and_then(|p| p.get(field))
      .and_then(Value::as_str)
      .and_then(|s| s.parse::<f64>().ok())
      .map(|p| p * 1_000_000.0)
  };

  let modalities = entry
    .get("architecture")
    .and_then(|a| a.get("input_modalities"))
    .and_then(Value::as_array)
    .map(|m| m.iter().filter_map(Value::as_str).collect::<Vec<_>>())
    .unwrap_or_default();
  let supported = entry
    .get("supported_parameters")
    .and_then(Value::as_array)
    .map(|p| p.iter().filter_map(Value::as_str).collect::<Vec<_>>())
    .unwrap_or_default();

  Some(ModelDescriptor {
    supports_images: modalities.contains(&"image"),
    supports_prompt_cache: per_token("input_cache_read").is_some(),
    input_price: per_token("prompt"),
    output_price: per_token("completion"),
    cache_reads_price: per_token("input_cache_read"),
    cache_writes_price: per_token("input_cache_write"),
    supports_reasoning_budget: supported.contains(&"reasoning"),
    supports_native_tools: supported.contains(&"tools"),
    ..ModelDescriptor::new(id, max_tokens, context_window)
  })
}

fn parse_openai_entry(entry: &Value) -> Option<ModelDescriptor> {
  let id = entry.get("id")?.as_str()?.to_string();
  if id.is_empty() {
    return None;
  }
  // The plain endpoint carries no capability data; sane defaults
  Some(ModelDescriptor::new(id, 8_192, 128_000))
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use wiremock::matchers::{method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn openrouter_body() -> Value {
    json!({"data": [
      {
        "id": "vendor/model-a",
        "context_length": 200_000,
        "top_provider": {"max_completion_tokens": 64_000},
        "pricing": {"prompt": "0.000003", "completion": "0.000015"},
        "architecture": {"input_modalities": ["text", "image"]},
        "supported_parameters": ["tools", "reasoning"]
      },
      {"id": "vendor/broken-no-context"}
    ]})
  }

  #[tokio::test]
  async fn test_fetch_maps_and_skips_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/models"))
      .respond_with(ResponseTemplate::new(200).set_body_json(openrouter_body()))
      .mount(&server)
      .await;

    let catalog = ModelCatalog::new();
    let models = catalog.openrouter_models(Some(&server.uri())).await;
    assert_eq!(models.len(), 1);
    let info = &models["vendor/model-a"];
    assert_eq!(info.max_tokens, 64_000);
    assert_eq!(info.input_price, Some(3.0));
    assert_eq!(info.output_price, Some(15.0));
    assert!(info.supports_images);
    assert!(info.supports_native_tools);
  }

  #[tokio::test]
  async fn test_failure_falls_back_to_cache_then_static() {
    let server = MockServer::start().await;
    let catalog = ModelCatalog::new();

    // No mock mounted yet: first call degrades to the static table
    let models = catalog.openrouter_models(Some(&server.uri())).await;
    assert!(models.contains_key("anthropic/claude-sonnet-4"));

    Mock::given(method("GET"))
      .and(path("/models"))
      .respond_with(ResponseTemplate::new(200).set_body_json(openrouter_body()))
      .expect(1)
      .mount(&server)
      .await;
    let fetched = catalog.openrouter_models(Some(&server.uri())).await;
    assert!(fetched.contains_key("vendor/model-a"));

    // Endpoint breaks again: the cached result survives
    server.reset().await;
    Mock::given(method("GET"))
      .and(path("/models"))
      .respond_with(ResponseTemplate::new(500))
      .mount(&server)
      .await;
    let cached = catalog.openrouter_models(Some(&server.uri())).await;
    assert!(cached.contains_key("vendor/model-a"));
  }

  #[tokio::test]
  async fn test_openai_compatible_listing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/models"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({
        "data": [{"id": "local-model"}, {"id": ""}]
      })))
      .mount(&server)
      .await;

    let catalog = ModelCatalog::new();
    let models = catalog.openai_compatible_models(&server.uri(), Some("key")).await;
    assert_eq!(models.len(), 1);
    assert!(models.contains_key("local-model"));
  }
}
