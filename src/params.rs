//! Model parameter resolution.
//!
//! Pure function from a model descriptor plus user settings to the effective
//! request parameters. No I/O.

use serde::{Deserialize, Serialize};

use crate::model::ModelDescriptor;
use crate::types::ProviderSettings;

pub const DEFAULT_REASONING_BUDGET: u32 = 8_192;
pub const DEFAULT_REASONING_EFFORT: &str = "medium";

/// Wire-parameter conventions the target vendor family follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamsFormat {
  OpenAi,
  Anthropic,
  OpenRouter,
}

impl ParamsFormat {
  fn default_temperature(self) -> f32 {
    match self {
      ParamsFormat::OpenAi | ParamsFormat::OpenRouter => 0.0,
      ParamsFormat::Anthropic => 1.0,
    }
  }
}

/// Resolved reasoning configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningConfig {
  /// Explicit thinking-token budget (Anthropic-style)
  Budget { budget_tokens: u32 },
  /// Effort tier (OpenAI reasoning-family style)
  Effort { effort: String },
}

/// Effective per-request parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelParams {
  pub max_tokens: Option<u32>,
  pub temperature: Option<f32>,
  pub reasoning: Option<ReasoningConfig>,
}

/// Derives effective temperature, max-tokens and reasoning config.
///
/// Temperature precedence: user override, then `default_temperature`, then the
/// format default (0.0 OpenAI-style, 1.0 Anthropic-style). `max_tokens` never
/// exceeds the model ceiling. Reasoning turns on only when the model supports
/// it and the user asked for it; `required_reasoning_budget` forces it on.
pub fn resolve_params(
  format: ParamsFormat,
  info: &ModelDescriptor,
  settings: &ProviderSettings,
  default_temperature: Option<f32>,
) -> ModelParams {
  let temperature = settings
    .model_temperature
    .or(default_temperature)
    .or(Some(format.default_temperature()));

  let max_tokens = Some(
    settings
      .model_max_tokens
      .map_or(info.max_tokens, |user| user.min(info.max_tokens)),
  );

  let reasoning_on = info.required_reasoning_budget
    || (settings.enable_reasoning
      && (info.supports_reasoning_budget || info.supports_reasoning_effort));

  let reasoning = if !reasoning_on {
    None
  } else if info.supports_reasoning_budget || info.required_reasoning_budget {
    Some(ReasoningConfig::Budget {
      budget_tokens: settings.reasoning_budget.unwrap_or(DEFAULT_REASONING_BUDGET),
    })
  } else {
    Some(ReasoningConfig::Effort {
      effort: settings
        .reasoning_effort
        .clone()
        .unwrap_or_else(|| DEFAULT_REASONING_EFFORT.to_string()),
    })
  };

  ModelParams {
    max_tokens,
    temperature,
    reasoning,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn settings() -> ProviderSettings {
    ProviderSettings::default()
  }

  #[test]
  fn test_format_default_temperatures() {
    let info = ModelDescriptor::new("m", 8192, 200_000);
    let p = resolve_params(ParamsFormat::OpenAi, &info, &settings(), None);
    assert_eq!(p.temperature, Some(0.0));
    let p = resolve_params(ParamsFormat::Anthropic, &info, &settings(), None);
    assert_eq!(p.temperature, Some(1.0));
  }

  #[test]
  fn test_user_temperature_wins() {
    let info = ModelDescriptor::new("m", 8192, 200_000);
    let mut s = settings();
    s.model_temperature = Some(0.7);
    let p = resolve_params(ParamsFormat::Anthropic, &info, &s, Some(0.5));
    assert_eq!(p.temperature, Some(0.7));
  }

  #[test]
  fn test_max_tokens_clamped_to_model_ceiling() {
    let info = ModelDescriptor::new("m", 4096, 200_000);
    let mut s = settings();
    s.model_max_tokens = Some(100_000);
    let p = resolve_params(ParamsFormat::OpenAi, &info, &s, None);
    assert_eq!(p.max_tokens, Some(4096));
  }

  #[test]
  fn test_reasoning_requires_support_and_opt_in() {
    let plain = ModelDescriptor::new("m", 8192, 200_000);
    let mut s = settings();
    s.enable_reasoning = true;
    assert_eq!(resolve_params(ParamsFormat::OpenAi, &plain, &s, None).reasoning, None);

    let budget = ModelDescriptor {
      supports_reasoning_budget: true,
      ..ModelDescriptor::new("m", 8192, 200_000)
    };
    assert_eq!(
      resolve_params(ParamsFormat::Anthropic, &budget, &s, None).reasoning,
      Some(ReasoningConfig::Budget {
        budget_tokens: DEFAULT_REASONING_BUDGET
      })
    );
  }

  #[test]
  fn test_required_budget_forces_reasoning_on() {
    let info = ModelDescriptor {
      required_reasoning_budget: true,
      ..ModelDescriptor::new("m", 8192, 200_000)
    };
    let p = resolve_params(ParamsFormat::Anthropic, &info, &settings(), None);
    assert!(matches!(p.reasoning, Some(ReasoningConfig::Budget { .. })));
  }

  #[test]
  fn test_effort_models_resolve_effort() {
    let info = ModelDescriptor {
      supports_reasoning_effort: true,
      ..ModelDescriptor::new("o3", 100_000, 200_000)
    };
    let mut s = settings();
    s.enable_reasoning = true;
    s.reasoning_effort = Some("high".to_string());
    assert_eq!(
      resolve_params(ParamsFormat::OpenAi, &info, &s, None).reasoning,
      Some(ReasoningConfig::Effort {
        effort: "high".to_string()
      })
    );
  }
}
