//! Model descriptors and static per-provider model tables.
//!
//! Each provider ships a hardcoded table of known models so a usable list is
//! always available even when the live catalog cannot be fetched. Descriptors
//! are immutable once constructed; prices are USD per million tokens.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::params::ModelParams;

/// Capability and pricing record for one model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelDescriptor {
  pub id: String,
  pub max_tokens: u32,
  pub context_window: u32,
  #[serde(default)]
  pub supports_images: bool,
  #[serde(default)]
  pub supports_prompt_cache: bool,
  /// USD per million input tokens; absent means free/unknown (0 in cost calc)
  #[serde(default)]
  pub input_price: Option<f64>,
  /// USD per million output tokens
  #[serde(default)]
  pub output_price: Option<f64>,
  #[serde(default)]
  pub cache_writes_price: Option<f64>,
  #[serde(default)]
  pub cache_reads_price: Option<f64>,
  #[serde(default)]
  pub supports_reasoning_budget: bool,
  #[serde(default)]
  pub supports_reasoning_effort: bool,
  #[serde(default)]
  pub required_reasoning_budget: bool,
  #[serde(default)]
  pub supports_computer_use: bool,
  #[serde(default)]
  pub supports_native_tools: bool,
}

impl ModelDescriptor {
  pub fn new(id: impl Into<String>, max_tokens: u32, context_window: u32) -> Self {
    Self {
      id: id.into(),
      max_tokens,
      context_window,
      supports_images: false,
      supports_prompt_cache: false,
      input_price: None,
      output_price: None,
      cache_writes_price: None,
      cache_reads_price: None,
      supports_reasoning_budget: false,
      supports_reasoning_effort: false,
      required_reasoning_budget: false,
      supports_computer_use: false,
      supports_native_tools: false,
    }
  }
}

/// `get_model()` result: configured id, descriptor, and resolved parameters.
#[derive(Debug, Clone)]
pub struct ResolvedModel {
  pub id: String,
  pub info: ModelDescriptor,
  pub params: ModelParams,
}

/// Looks up `model_id` in `table`, falling back to `default_id`.
///
/// Never fails for a configured-but-unknown id: if neither entry exists a
/// conservative descriptor is synthesized around the configured id.
pub fn lookup_model(
  table: &HashMap<String, ModelDescriptor>,
  model_id: Option<&str>,
  default_id: &str,
) -> (String, ModelDescriptor) {
  let id = model_id.filter(|m| !m.is_empty()).unwrap_or(default_id);
  if let Some(info) = table.get(id) {
    return (id.to_string(), info.clone());
  }
  if let Some(info) = table.get(default_id) {
    return (id.to_string(), info.clone());
  }
  (id.to_string(), ModelDescriptor::new(id, 8192, 128_000))
}

pub const ANTHROPIC_DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
pub const OPENAI_DEFAULT_MODEL: &str = "gpt-4.1";
pub const CEREBRAS_DEFAULT_MODEL: &str = "llama-3.3-70b";
pub const OPENROUTER_DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4";
pub const KILOCODE_DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4";
pub const COPILOT_DEFAULT_MODEL: &str = "gpt-4.1";
pub const BEDROCK_DEFAULT_MODEL: &str = "anthropic.claude-sonnet-4-20250514-v1:0";

pub fn anthropic_models() -> HashMap<String, ModelDescriptor> {
  let mut m = HashMap::new();
  m.insert(
    "claude-sonnet-4-20250514".to_string(),
    ModelDescriptor {
      supports_images: true,
      supports_prompt_cache: true,
      input_price: Some(3.0),
      output_price: Some(15.0),
      cache_writes_price: Some(3.75),
      cache_reads_price: Some(0.3),
      supports_reasoning_budget: true,
      supports_computer_use: true,
      supports_native_tools: true,
      ..ModelDescriptor::new("claude-sonnet-4-20250514", 64_000, 200_000)
    },
  );
  m.insert(
    "claude-opus-4-20250514".to_string(),
    ModelDescriptor {
      supports_images: true,
      supports_prompt_cache: true,
      input_price: Some(15.0),
      output_price: Some(75.0),
      cache_writes_price: Some(18.75),
      cache_reads_price: Some(1.5),
      supports_reasoning_budget: true,
      supports_native_tools: true,
      ..ModelDescriptor::new("claude-opus-4-20250514", 32_000, 200_000)
    },
  );
  m.insert(
    "claude-3-5-haiku-20241022".to_string(),
    ModelDescriptor {
      supports_prompt_cache: true,
      input_price: Some(0.8),
      output_price: Some(4.0),
      cache_writes_price: Some(1.0),
      cache_reads_price: Some(0.08),
      supports_native_tools: true,
      ..ModelDescriptor::new("claude-3-5-haiku-20241022", 8_192, 200_000)
    },
  );
  m
}

pub fn openai_models() -> HashMap<String, ModelDescriptor> {
  let mut m = HashMap::new();
  m.insert(
    "gpt-4.1".to_string(),
    ModelDescriptor {
      supports_images: true,
      supports_prompt_cache: true,
      input_price: Some(2.0),
      output_price: Some(8.0),
      cache_reads_price: Some(0.5),
      supports_native_tools: true,
      ..ModelDescriptor::new("gpt-4.1", 32_768, 1_047_576)
    },
  );
  m.insert(
    "gpt-4o".to_string(),
    ModelDescriptor {
      supports_images: true,
      supports_prompt_cache: true,
      input_price: Some(2.5),
      output_price: Some(10.0),
      cache_reads_price: Some(1.25),
      supports_native_tools: true,
      ..ModelDescriptor::new("gpt-4o", 16_384, 128_000)
    },
  );
  m.insert(
    "o3".to_string(),
    ModelDescriptor {
      supports_images: true,
      supports_prompt_cache: true,
      input_price: Some(2.0),
      output_price: Some(8.0),
      supports_reasoning_effort: true,
      supports_native_tools: true,
      ..ModelDescriptor::new("o3", 100_000, 200_000)
    },
  );
  m.insert(
    "o4-mini".to_string(),
    ModelDescriptor {
      supports_images: true,
      supports_prompt_cache: true,
      input_price: Some(1.1),
      output_price: Some(4.4),
      supports_reasoning_effort: true,
      supports_native_tools: true,
      ..ModelDescriptor::new("o4-mini", 100_000, 200_000)
    },
  );
  m.insert(
    "codex-mini-latest".to_string(),
    ModelDescriptor {
      input_price: Some(1.5),
      output_price: Some(6.0),
      supports_reasoning_effort: true,
      supports_native_tools: true,
      ..ModelDescriptor::new("codex-mini-latest", 100_000, 200_000)
    },
  );
  m
}

pub fn cerebras_models() -> HashMap<String, ModelDescriptor> {
  let mut m = HashMap::new();
  m.insert(
    "llama-3.3-70b".to_string(),
    ModelDescriptor::new("llama-3.3-70b", 8_192, 128_000),
  );
  m.insert(
    "qwen-3-32b".to_string(),
    ModelDescriptor {
      supports_reasoning_budget: true,
      ..ModelDescriptor::new("qwen-3-32b", 16_384, 131_072)
    },
  );
  m
}

pub fn openrouter_models() -> HashMap<String, ModelDescriptor> {
  let mut m = HashMap::new();
  m.insert(
    "anthropic/claude-sonnet-4".to_string(),
    ModelDescriptor {
      supports_images: true,
      supports_prompt_cache: true,
      input_price: Some(3.0),
      output_price: Some(15.0),
      supports_reasoning_budget: true,
      supports_native_tools: true,
      ..ModelDescriptor::new("anthropic/claude-sonnet-4", 64_000, 200_000)
    },
  );
  m.insert(
    "openai/gpt-4.1".to_string(),
    ModelDescriptor {
      supports_images: true,
      input_price: Some(2.0),
      output_price: Some(8.0),
      supports_native_tools: true,
      ..ModelDescriptor::new("openai/gpt-4.1", 32_768, 1_047_576)
    },
  );
  m
}

pub fn bedrock_models() -> HashMap<String, ModelDescriptor> {
  let mut m = HashMap::new();
  m.insert(
    "anthropic.claude-sonnet-4-20250514-v1:0".to_string(),
    ModelDescriptor {
      supports_images: true,
      supports_prompt_cache: true,
      input_price: Some(3.0),
      output_price: Some(15.0),
      supports_reasoning_budget: true,
      supports_native_tools: true,
      ..ModelDescriptor::new("anthropic.claude-sonnet-4-20250514-v1:0", 64_000, 200_000)
    },
  );
  m.insert(
    "amazon.nova-pro-v1:0".to_string(),
    ModelDescriptor {
      supports_images: true,
      input_price: Some(0.8),
      output_price: Some(3.2),
      supports_native_tools: true,
      ..ModelDescriptor::new("amazon.nova-pro-v1:0", 5_120, 300_000)
    },
  );
  m
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_lookup_known_model() {
    let table = anthropic_models();
    let (id, info) = lookup_model(&table, Some("claude-opus-4-20250514"), ANTHROPIC_DEFAULT_MODEL);
    assert_eq!(id, "claude-opus-4-20250514");
    assert_eq!(info.max_tokens, 32_000);
  }

  #[test]
  fn test_lookup_unknown_model_keeps_id_uses_default_info() {
    let table = anthropic_models();
    let (id, info) = lookup_model(&table, Some("claude-next"), ANTHROPIC_DEFAULT_MODEL);
    assert_eq!(id, "claude-next");
    assert_eq!(info.id, ANTHROPIC_DEFAULT_MODEL);
  }

  #[test]
  fn test_lookup_empty_id_falls_back_to_default() {
    let table = openai_models();
    let (id, _) = lookup_model(&table, Some(""), OPENAI_DEFAULT_MODEL);
    assert_eq!(id, OPENAI_DEFAULT_MODEL);
  }
}
